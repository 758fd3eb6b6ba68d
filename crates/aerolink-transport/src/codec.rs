//! # Block Erasure Coder
//!
//! Systematic MDS erasure code over GF(2^8). A block of `K` equal-length
//! data shards produces `M` parity shards; any `K` of the `K + M` shards
//! recover the block.
//!
//! Parity row `j` uses Cauchy coefficients `1 / ((K + j) ^ i)` for data
//! shard `i`. Every square submatrix of a Cauchy matrix is invertible, so a
//! decode succeeds whenever at least as many parity shards arrived as data
//! shards were lost.
//!
//! ## GF(2^8) Arithmetic
//!
//! Polynomial x^8 + x^4 + x^3 + x^2 + 1 (0x11D) with generator 2.

use thiserror::Error;

// ─── GF(2^8) Arithmetic ────────────────────────────────────────────────────

/// Multiplication and inverse tables for GF(2^8) with polynomial 0x11D.
struct Gf256Tables {
    mul: [[u8; 256]; 256],
    inv: [u8; 256],
}

impl Gf256Tables {
    const fn generate() -> Self {
        let mut mul = [[0u8; 256]; 256];
        let mut inv = [0u8; 256];

        let mut exp = [0u8; 256];
        let mut log = [0u8; 256];
        let mut val: u16 = 1;
        let mut i: usize = 0;
        while i < 255 {
            exp[i] = val as u8;
            log[val as usize] = i as u8;
            val <<= 1;
            if val & 0x100 != 0 {
                val ^= 0x11D;
            }
            i += 1;
        }
        exp[255] = exp[0];

        let mut a = 1usize;
        while a < 256 {
            let mut b = 1usize;
            while b < 256 {
                let log_sum = (log[a] as u16 + log[b] as u16) % 255;
                mul[a][b] = exp[log_sum as usize];
                b += 1;
            }
            a += 1;
        }

        i = 1;
        while i < 256 {
            let l = log[i] as u16;
            inv[i] = exp[((255 - l) % 255) as usize];
            i += 1;
        }

        Gf256Tables { mul, inv }
    }
}

static GF: Gf256Tables = Gf256Tables::generate();

#[inline]
fn gf_mul(a: u8, b: u8) -> u8 {
    GF.mul[a as usize][b as usize]
}

#[inline]
fn gf_inv(a: u8) -> u8 {
    GF.inv[a as usize]
}

/// `dst ^= c * src`, element-wise.
#[inline]
fn mul_add_slice(dst: &mut [u8], src: &[u8], c: u8) {
    match c {
        0 => {}
        1 => {
            for (d, s) in dst.iter_mut().zip(src) {
                *d ^= *s;
            }
        }
        _ => {
            let row = &GF.mul[c as usize];
            for (d, s) in dst.iter_mut().zip(src) {
                *d ^= row[*s as usize];
            }
        }
    }
}

// ─── Errors ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("block not recoverable: {erasures} erased shards, {parity} parity shards available")]
    NotRecoverable { erasures: usize, parity: usize },
    #[error("shard length mismatch: expected {expected} bytes, got {actual}")]
    ShardLength { expected: usize, actual: usize },
    #[error("too many shards: {data} data + {parity} parity exceeds 256")]
    TooManyShards { data: usize, parity: usize },
    #[error("shard index {index} out of range (limit {limit})")]
    IndexOutOfRange { index: usize, limit: usize },
    #[error("shard count mismatch: expected {expected}, got {actual}")]
    ShardCount { expected: usize, actual: usize },
}

// ─── Erasure Coder ─────────────────────────────────────────────────────────

/// Erasure coder for a fixed `(K, M)` shape.
///
/// The coefficient matrix is computed once at construction; encode and
/// decode then only touch the shard buffers.
#[derive(Debug, Clone)]
pub struct ErasureCoder {
    data_shards: usize,
    parity_shards: usize,
    /// `matrix[j * K + i]` = coefficient of data shard `i` in parity `j`.
    matrix: Vec<u8>,
}

impl ErasureCoder {
    pub fn new(data_shards: usize, parity_shards: usize) -> Result<Self, CodecError> {
        if data_shards == 0 || data_shards + parity_shards > 256 {
            return Err(CodecError::TooManyShards {
                data: data_shards,
                parity: parity_shards,
            });
        }
        let mut matrix = Vec::with_capacity(data_shards * parity_shards);
        for j in 0..parity_shards {
            let x = (data_shards + j) as u8;
            for i in 0..data_shards {
                matrix.push(gf_inv(x ^ i as u8));
            }
        }
        Ok(ErasureCoder {
            data_shards,
            parity_shards,
            matrix,
        })
    }

    pub fn data_shards(&self) -> usize {
        self.data_shards
    }

    pub fn parity_shards(&self) -> usize {
        self.parity_shards
    }

    /// Whether this coder was built for the given shape.
    pub fn matches(&self, data_shards: usize, parity_shards: usize) -> bool {
        self.data_shards == data_shards && self.parity_shards == parity_shards
    }

    #[inline]
    fn coefficient(&self, parity: usize, data: usize) -> u8 {
        self.matrix[parity * self.data_shards + data]
    }

    /// Compute all `M` parity shards from `K` data shards.
    ///
    /// Only the first `shard_len` bytes of each shard are read or written.
    /// `M = 0` is a no-op.
    pub fn encode<D, P>(
        &self,
        shard_len: usize,
        data: &[D],
        parity: &mut [P],
    ) -> Result<(), CodecError>
    where
        D: AsRef<[u8]>,
        P: AsMut<[u8]>,
    {
        check_count(self.data_shards, data.len())?;
        check_count(self.parity_shards, parity.len())?;
        for shard in data {
            check_len(shard_len, shard.as_ref().len())?;
        }

        for (j, out) in parity.iter_mut().enumerate() {
            let out = out.as_mut();
            check_len(shard_len, out.len())?;
            let out = &mut out[..shard_len];
            out.fill(0);
            for (i, shard) in data.iter().enumerate() {
                mul_add_slice(out, &shard.as_ref()[..shard_len], self.coefficient(j, i));
            }
        }
        Ok(())
    }

    /// Reconstruct erased data shards in place.
    ///
    /// `parity[n]` holds the received parity shard with index
    /// `parity_ids[n]` (0-based within the parity region). `erased` lists
    /// the data shard indices whose contents are missing; they are
    /// overwritten. The first `erased.len()` parity shards are used.
    pub fn decode<D, P>(
        &self,
        shard_len: usize,
        data: &mut [D],
        parity: &[P],
        parity_ids: &[usize],
        erased: &[usize],
    ) -> Result<(), CodecError>
    where
        D: AsMut<[u8]>,
        P: AsRef<[u8]>,
    {
        check_count(self.data_shards, data.len())?;
        check_count(parity.len(), parity_ids.len())?;
        if erased.is_empty() {
            return Ok(());
        }
        let e = erased.len();
        if e > parity.len() {
            return Err(CodecError::NotRecoverable {
                erasures: e,
                parity: parity.len(),
            });
        }
        for &idx in erased {
            if idx >= self.data_shards {
                return Err(CodecError::IndexOutOfRange {
                    index: idx,
                    limit: self.data_shards,
                });
            }
        }
        for &id in &parity_ids[..e] {
            if id >= self.parity_shards {
                return Err(CodecError::IndexOutOfRange {
                    index: id,
                    limit: self.parity_shards,
                });
            }
        }
        for shard in data.iter_mut() {
            check_len(shard_len, shard.as_mut().len())?;
        }
        for shard in &parity[..e] {
            check_len(shard_len, shard.as_ref().len())?;
        }

        let mut is_erased = vec![false; self.data_shards];
        for &idx in erased {
            is_erased[idx] = true;
        }

        // Syndromes: received parity minus the contribution of known data.
        let mut syndromes: Vec<Vec<u8>> = Vec::with_capacity(e);
        for (row, &pid) in parity_ids[..e].iter().enumerate() {
            let mut s = parity[row].as_ref()[..shard_len].to_vec();
            for (i, shard) in data.iter_mut().enumerate() {
                if !is_erased[i] {
                    mul_add_slice(&mut s, &shard.as_mut()[..shard_len], self.coefficient(pid, i));
                }
            }
            syndromes.push(s);
        }

        let mut system = Vec::with_capacity(e * e);
        for &pid in &parity_ids[..e] {
            for &col in erased {
                system.push(self.coefficient(pid, col));
            }
        }
        let inverse = invert_matrix(&mut system, e).ok_or(CodecError::NotRecoverable {
            erasures: e,
            parity: parity.len(),
        })?;

        for (c, &idx) in erased.iter().enumerate() {
            let out = &mut data[idx].as_mut()[..shard_len];
            out.fill(0);
            for (r, s) in syndromes.iter().enumerate() {
                mul_add_slice(out, s, inverse[c * e + r]);
            }
        }
        Ok(())
    }
}

fn check_len(expected: usize, actual: usize) -> Result<(), CodecError> {
    if actual < expected {
        return Err(CodecError::ShardLength { expected, actual });
    }
    Ok(())
}

fn check_count(expected: usize, actual: usize) -> Result<(), CodecError> {
    if expected != actual {
        return Err(CodecError::ShardCount { expected, actual });
    }
    Ok(())
}

/// Gauss-Jordan inversion of an `n x n` row-major matrix over GF(2^8).
/// Returns `None` if the matrix is singular.
fn invert_matrix(m: &mut [u8], n: usize) -> Option<Vec<u8>> {
    let mut inv = vec![0u8; n * n];
    for i in 0..n {
        inv[i * n + i] = 1;
    }

    for col in 0..n {
        let pivot = (col..n).find(|&r| m[r * n + col] != 0)?;
        if pivot != col {
            for k in 0..n {
                m.swap(pivot * n + k, col * n + k);
                inv.swap(pivot * n + k, col * n + k);
            }
        }

        let scale = gf_inv(m[col * n + col]);
        for k in 0..n {
            m[col * n + k] = gf_mul(m[col * n + k], scale);
            inv[col * n + k] = gf_mul(inv[col * n + k], scale);
        }

        for r in 0..n {
            if r == col {
                continue;
            }
            let factor = m[r * n + col];
            if factor == 0 {
                continue;
            }
            for k in 0..n {
                m[r * n + k] ^= gf_mul(factor, m[col * n + k]);
                inv[r * n + k] ^= gf_mul(factor, inv[col * n + k]);
            }
        }
    }
    Some(inv)
}

// ─── Tests ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gf_mul_identity() {
        for a in 0..=255u8 {
            assert_eq!(gf_mul(a, 1), a);
            assert_eq!(gf_mul(1, a), a);
        }
    }

    #[test]
    fn gf_mul_zero() {
        for a in 0..=255u8 {
            assert_eq!(gf_mul(a, 0), 0);
        }
    }

    #[test]
    fn gf_inverse_property() {
        for a in 1..=255u8 {
            assert_eq!(gf_mul(a, gf_inv(a)), 1, "a={a}");
        }
    }

    #[test]
    fn gf_generator_two() {
        // 0x11D: 2^8 = 0x1D.
        assert_eq!(gf_mul(0x80, 2), 0x1D);
    }

    fn block(k: usize, len: usize) -> Vec<Vec<u8>> {
        (0..k)
            .map(|i| (0..len).map(|b| (i * 37 + b * 11 + 5) as u8).collect())
            .collect()
    }

    #[test]
    fn recovers_single_erasure() {
        let coder = ErasureCoder::new(8, 2).unwrap();
        let data = block(8, 100);
        let mut parity = vec![vec![0u8; 100]; 2];
        coder.encode(100, &data, &mut parity).unwrap();

        let mut received = data.clone();
        received[3] = vec![0xAA; 100];
        coder
            .decode(100, &mut received, &parity[1..], &[1], &[3])
            .unwrap();
        assert_eq!(received, data);
    }

    #[test]
    fn recovers_max_erasures_odd_length() {
        let coder = ErasureCoder::new(5, 3).unwrap();
        let data = block(5, 7);
        let mut parity = vec![vec![0u8; 7]; 3];
        coder.encode(7, &data, &mut parity).unwrap();

        let mut received = data.clone();
        for i in [0, 2, 4] {
            received[i].fill(0);
        }
        coder
            .decode(7, &mut received, &parity, &[0, 1, 2], &[0, 2, 4])
            .unwrap();
        assert_eq!(received, data);
    }

    #[test]
    fn too_many_erasures_is_not_recoverable() {
        let coder = ErasureCoder::new(4, 1).unwrap();
        let mut data = block(4, 16);
        let mut parity = vec![vec![0u8; 16]; 1];
        coder.encode(16, &data, &mut parity).unwrap();
        let err = coder
            .decode(16, &mut data, &parity, &[0], &[0, 1])
            .unwrap_err();
        assert_eq!(
            err,
            CodecError::NotRecoverable {
                erasures: 2,
                parity: 1
            }
        );
    }

    #[test]
    fn zero_parity_encodes_nothing() {
        let coder = ErasureCoder::new(3, 0).unwrap();
        let data = block(3, 10);
        let mut parity: Vec<Vec<u8>> = Vec::new();
        coder.encode(10, &data, &mut parity).unwrap();
    }

    #[test]
    fn rejects_oversized_shape() {
        assert!(ErasureCoder::new(200, 57).is_err());
        assert!(ErasureCoder::new(0, 4).is_err());
        assert!(ErasureCoder::new(200, 56).is_ok());
    }

    #[test]
    fn short_shard_rejected() {
        let coder = ErasureCoder::new(2, 1).unwrap();
        let data = vec![vec![1u8; 10], vec![2u8; 9]];
        let mut parity = vec![vec![0u8; 10]];
        assert_eq!(
            coder.encode(10, &data, &mut parity),
            Err(CodecError::ShardLength {
                expected: 10,
                actual: 9
            })
        );
    }

    #[test]
    fn shards_longer_than_shard_len_are_fine() {
        let coder = ErasureCoder::new(2, 1).unwrap();
        let data = vec![vec![1u8; 20], vec![2u8; 20]];
        let mut parity = vec![vec![0xFFu8; 20]];
        coder.encode(4, &data, &mut parity).unwrap();
        // Bytes past shard_len are untouched.
        assert_eq!(parity[0][4..], [0xFF; 16]);
    }
}
