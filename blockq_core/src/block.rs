//! Immutable (CID, bytes) pairs.

use crate::error::{Error, Result};
use crate::hash::{CidPrefix, verify_cid};
use cid::Cid;

/// A block: raw bytes and the CID they hash to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    cid: Cid,
    data: Vec<u8>,
}

impl Block {
    /// Hash `data` under `prefix` and build the block.
    pub fn new(prefix: CidPrefix, data: Vec<u8>) -> Result<Self> {
        let cid = prefix.sum(&data)?;
        Ok(Self { cid, data })
    }

    /// Build a block from a claimed CID, verifying the claim.
    pub fn with_cid(cid: Cid, data: Vec<u8>) -> Result<Self> {
        if !verify_cid(&cid, &data)? {
            return Err(Error::integrity_fault(
                cid,
                "data does not hash to the declared cid",
            ));
        }
        Ok(Self { cid, data })
    }

    /// Build a block whose bytes were verified elsewhere.
    pub(crate) fn new_unchecked(cid: Cid, data: Vec<u8>) -> Self {
        Self { cid, data }
    }

    pub fn cid(&self) -> &Cid {
        &self.cid
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Recompute the hash and compare against the CID.
    pub fn verify(&self) -> Result<()> {
        if verify_cid(&self.cid, &self.data)? {
            Ok(())
        } else {
            Err(Error::integrity_fault(
                self.cid,
                "data does not hash to the declared cid",
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::hash::{Algorithm, Codec};

    fn raw() -> CidPrefix {
        CidPrefix::new(Codec::Raw, Algorithm::Blake3)
    }

    #[test]
    fn test_new_block_verifies() {
        let block = Block::new(raw(), b"hello".to_vec()).unwrap();
        assert_eq!(block.len(), 5);
        block.verify().unwrap();
    }

    #[test]
    fn test_with_cid_rejects_mismatch() {
        let cid = raw().sum(b"hello").unwrap();
        let err = Block::with_cid(cid, b"jello".to_vec()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IntegrityFault);
    }

    #[test]
    fn test_unchecked_block_fails_verify() {
        let cid = raw().sum(b"hello").unwrap();
        let block = Block::new_unchecked(cid, b"tampered".to_vec());
        assert_eq!(block.verify().unwrap_err().kind(), ErrorKind::IntegrityFault);
    }
}
