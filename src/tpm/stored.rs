use super::wire::{Reader, Writer};
use super::{Result, TpmError};

pub const TAG_STORED_DATA12: u16 = 0x0016;

/// A `TPM_STORED_DATA12` sealed blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredData {
    pub entity_type: u16,
    pub seal_info: Vec<u8>,
    pub enc_data: Vec<u8>,
}

impl StoredData {
    pub fn read(reader: &mut Reader<'_>) -> Result<Self> {
        let tag = reader.u16()?;
        if tag != TAG_STORED_DATA12 {
            return Err(TpmError::BadStoredData(tag));
        }
        Ok(Self {
            entity_type: reader.u16()?,
            seal_info: reader.sized()?.to_vec(),
            enc_data: reader.sized()?.to_vec(),
        })
    }

    /// Parses a blob from the front of an NV area; padding behind it is ignored.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Self::read(&mut Reader::new(bytes))
    }

    pub fn write(&self, writer: Writer) -> Writer {
        writer
            .u16(TAG_STORED_DATA12)
            .u16(self.entity_type)
            .sized(&self.seal_info)
            .sized(&self.enc_data)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.write(Writer::new()).as_bytes().to_vec()
    }

    /// The blob zero-padded to exactly `capacity` bytes.
    pub fn to_padded(&self, capacity: usize) -> Result<Vec<u8>> {
        let mut bytes = self.to_bytes();
        if bytes.len() > capacity {
            return Err(TpmError::BlobTooLarge {
                size: bytes.len(),
                capacity,
            });
        }
        bytes.resize(capacity, 0);
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eyre::Result;

    fn blob() -> StoredData {
        StoredData {
            entity_type: 0,
            seal_info: vec![1, 2, 3],
            enc_data: vec![0xee; 256],
        }
    }

    #[test]
    fn padded_blob_parses_back() -> Result<()> {
        let padded = blob().to_padded(400)?;
        assert_eq!(padded.len(), 400);
        assert_eq!(&padded[..2], &[0x00, 0x16]);
        assert_eq!(StoredData::from_bytes(&padded)?, blob());
        Ok(())
    }

    #[test]
    fn oversized_blob_is_refused() {
        assert!(matches!(
            blob().to_padded(100),
            Err(TpmError::BlobTooLarge {
                size: 271,
                capacity: 100
            })
        ));
    }

    #[test]
    fn wrong_tag_is_refused() {
        assert!(matches!(
            StoredData::from_bytes(&[0x00, 0x01, 0, 0]),
            Err(TpmError::BadStoredData(0x0001))
        ));
    }
}
