//! LUKS anti-forensic information splitter.

use super::cipher::Hash;
use super::{LuksError, Result};
use rand::RngCore;
use zeroize::Zeroizing;

/// Replaces each digest-sized block `i` with `H(be32(i) || block)`.
/// A short final block takes a truncated hash.
fn diffuse(hash: Hash, buf: &mut [u8]) {
    let size = hash.digest_size();
    for (i, block) in buf.chunks_mut(size).enumerate() {
        let digest = hash.digest(&[&(i as u32).to_be_bytes(), block]);
        let len = block.len();
        block.copy_from_slice(&digest[..len]);
    }
}

fn xor_into(dst: &mut [u8], src: &[u8]) {
    for (d, s) in dst.iter_mut().zip(src) {
        *d ^= s;
    }
}

fn check(material_len: usize, key_len: usize, stripes: u32) -> Result<()> {
    if key_len == 0 || stripes == 0 {
        return Err(LuksError::InvalidStripes { key_len, stripes });
    }
    if material_len < key_len * stripes as usize {
        return Err(LuksError::ShortKeyMaterial {
            expected: key_len * stripes as usize,
            actual: material_len,
        });
    }
    Ok(())
}

/// Recombines `stripes` blocks of `key_len` bytes into one key.
pub fn merge(
    hash: Hash,
    material: &[u8],
    key_len: usize,
    stripes: u32,
) -> Result<Zeroizing<Vec<u8>>> {
    check(material.len(), key_len, stripes)?;
    let mut buf = Zeroizing::new(vec![0u8; key_len]);
    let mut blocks = material.chunks_exact(key_len).take(stripes as usize);
    for stripe in blocks.by_ref().take(stripes as usize - 1) {
        xor_into(&mut buf, stripe);
        diffuse(hash, &mut buf);
    }
    if let Some(last) = blocks.next() {
        xor_into(&mut buf, last);
    }
    Ok(buf)
}

/// Spreads `key` over `stripes` random-looking blocks.
pub fn split<R: RngCore>(
    hash: Hash,
    key: &[u8],
    stripes: u32,
    rng: &mut R,
) -> Result<Zeroizing<Vec<u8>>> {
    let key_len = key.len();
    check(key_len * stripes as usize, key_len, stripes)?;
    let mut material = Zeroizing::new(vec![0u8; key_len * stripes as usize]);
    let mut buf = Zeroizing::new(vec![0u8; key_len]);
    let (head, last) = material.split_at_mut(key_len * (stripes as usize - 1));
    for stripe in head.chunks_exact_mut(key_len) {
        rng.fill_bytes(stripe);
        xor_into(&mut buf, stripe);
        diffuse(hash, &mut buf);
    }
    last.copy_from_slice(&buf);
    xor_into(last, key);
    Ok(material)
}

#[cfg(test)]
mod tests {
    use super::*;
    use eyre::Result;
    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn single_stripe_is_the_key() -> Result<()> {
        let key = [0xa5u8; 16];
        let material = split(Hash::Sha1, &key, 1, &mut StdRng::seed_from_u64(1))?;
        assert_eq!(material.as_slice(), &key);
        assert_eq!(merge(Hash::Sha1, &material, 16, 1)?.as_slice(), &key);
        Ok(())
    }

    #[test]
    fn diffuse_handles_partial_block() {
        let mut buf = [0u8; 24];
        diffuse(Hash::Sha1, &mut buf);
        let first = Hash::Sha1.digest(&[&[0, 0, 0, 0], &[0; 20]]);
        let second = Hash::Sha1.digest(&[&[0, 0, 0, 1], &[0; 4]]);
        assert_eq!(&buf[..20], &first[..]);
        assert_eq!(&buf[20..], &second[..4]);
    }

    #[test]
    fn zero_stripes_are_rejected() {
        assert!(matches!(
            merge(Hash::Sha256, &[], 32, 0),
            Err(LuksError::InvalidStripes { stripes: 0, .. })
        ));
    }

    #[test]
    fn short_material_is_rejected() {
        assert!(matches!(
            merge(Hash::Sha256, &[0; 40], 32, 2),
            Err(LuksError::ShortKeyMaterial {
                expected: 64,
                actual: 40
            })
        ));
    }

    #[test]
    fn a_single_stripe_does_not_reveal_the_key() -> Result<()> {
        let key = [0x42u8; 32];
        let mut material = split(Hash::Sha256, &key, 4, &mut StdRng::seed_from_u64(7))?;
        material[0] ^= 1;
        assert_ne!(merge(Hash::Sha256, &material, 32, 4)?.as_slice(), &key);
        Ok(())
    }

    proptest! {
        #[test]
        fn split_then_merge_recovers_key(
            stripes in prop::sample::select(vec![1u32, 2, 4, 8]),
            key in prop::sample::select(vec![16usize, 32, 64])
                .prop_flat_map(|len| prop::collection::vec(any::<u8>(), len)),
            hash in prop::sample::select(vec![Hash::Sha1, Hash::Sha256, Hash::Sha512]),
            seed in any::<u64>(),
        ) {
            let material = split(hash, &key, stripes, &mut StdRng::seed_from_u64(seed)).unwrap();
            prop_assert_eq!(material.len(), key.len() * stripes as usize);
            let merged = merge(hash, &material, key.len(), stripes).unwrap();
            prop_assert_eq!(merged.as_slice(), key.as_slice());
        }
    }
}
