//! Systematic Reed–Solomon erasure coding over GF(2^8)
//!
//! The code is built from a Vandermonde matrix reduced to systematic form,
//! so any `k` of the `k + r` shards reconstruct the original `k` data
//! shards. Shards must have equal length; the producer zero-pads the tail
//! data shard before encoding.

use crate::error::FecError;

const GF_POLY: u16 = 0x11d;
const GF_ORDER: usize = 255;

/// GF(2^8) log/antilog tables
struct GfTables {
    exp: [u8; 2 * GF_ORDER],
    log: [u8; 256],
}

impl GfTables {
    fn new() -> Self {
        let mut exp = [0u8; 2 * GF_ORDER];
        let mut log = [0u8; 256];
        let mut x: u16 = 1;
        for i in 0..GF_ORDER {
            exp[i] = x as u8;
            log[x as usize] = i as u8;
            x <<= 1;
            if x & 0x100 != 0 {
                x ^= GF_POLY;
            }
        }
        for i in GF_ORDER..2 * GF_ORDER {
            exp[i] = exp[i - GF_ORDER];
        }
        Self { exp, log }
    }

    #[inline]
    fn mul(&self, a: u8, b: u8) -> u8 {
        if a == 0 || b == 0 {
            0
        } else {
            self.exp[self.log[a as usize] as usize + self.log[b as usize] as usize]
        }
    }

    #[inline]
    fn inv(&self, a: u8) -> u8 {
        debug_assert_ne!(a, 0);
        self.exp[GF_ORDER - self.log[a as usize] as usize]
    }

    /// α^(i·j), the Vandermonde entry for evaluation point α^i
    #[inline]
    fn vandermonde(&self, i: usize, j: usize) -> u8 {
        self.exp[(i * j) % GF_ORDER]
    }
}

/// Erasure codec for a fixed `k` data + `r` parity geometry
pub struct ReedSolomon {
    k: usize,
    r: usize,
    gf: GfTables,
    /// (k + r) × k systematic encoding matrix; top k rows are the identity
    matrix: Vec<Vec<u8>>,
}

impl ReedSolomon {
    pub fn new(data_shards: usize, parity_shards: usize) -> Result<Self, FecError> {
        let (k, r) = (data_shards, parity_shards);
        if k == 0 || r == 0 || k + r > GF_ORDER {
            return Err(FecError::BadGeometry { data: k, parity: r });
        }

        let gf = GfTables::new();

        let vandermonde: Vec<Vec<u8>> = (0..k + r)
            .map(|i| (0..k).map(|j| gf.vandermonde(i, j)).collect())
            .collect();

        // Multiply by the inverse of the top k×k block: the top rows become
        // the identity while any k rows remain linearly independent.
        let top_inv =
            invert(&gf, &vandermonde[..k]).expect("Vandermonde top block is invertible");
        let matrix: Vec<Vec<u8>> = (0..k + r)
            .map(|i| {
                (0..k)
                    .map(|j| {
                        let mut acc = 0u8;
                        for (l, row) in top_inv.iter().enumerate() {
                            acc ^= gf.mul(vandermonde[i][l], row[j]);
                        }
                        acc
                    })
                    .collect()
            })
            .collect();

        Ok(Self { k, r, gf, matrix })
    }

    pub fn data_shards(&self) -> usize {
        self.k
    }

    pub fn parity_shards(&self) -> usize {
        self.r
    }

    /// Compute the `r` parity shards for `k` equal-length data shards.
    pub fn encode(&self, shards: &[&[u8]]) -> Result<Vec<Vec<u8>>, FecError> {
        if shards.len() != self.k {
            return Err(FecError::BadGeometry {
                data: shards.len(),
                parity: self.r,
            });
        }
        let len = shards[0].len();
        for shard in shards {
            if shard.len() != len {
                return Err(FecError::ShardLength {
                    expected: len,
                    got: shard.len(),
                });
            }
        }

        let mut parity = vec![vec![0u8; len]; self.r];
        for (p, out) in parity.iter_mut().enumerate() {
            let row = &self.matrix[self.k + p];
            for (j, shard) in shards.iter().enumerate() {
                let coeff = row[j];
                if coeff == 0 {
                    continue;
                }
                for (o, &b) in out.iter_mut().zip(shard.iter()) {
                    *o ^= self.gf.mul(coeff, b);
                }
            }
        }
        Ok(parity)
    }

    /// Reconstruct the missing data shards in place. `shards` holds `k + r`
    /// entries in shard order (data first, then parity); `None` marks an
    /// erasure. On success every data entry is `Some`.
    pub fn reconstruct(&self, shards: &mut [Option<Vec<u8>>]) -> Result<(), FecError> {
        if shards.len() != self.k + self.r {
            return Err(FecError::BadGeometry {
                data: self.k,
                parity: self.r,
            });
        }
        if shards[..self.k].iter().all(Option::is_some) {
            return Ok(());
        }

        let available: Vec<usize> = shards
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|_| i))
            .take(self.k)
            .collect();
        if available.len() < self.k {
            return Err(FecError::NotEnoughShards {
                have: available.len(),
                need: self.k,
            });
        }

        let len = shards[available[0]].as_ref().unwrap().len();
        for &i in &available {
            let got = shards[i].as_ref().unwrap().len();
            if got != len {
                return Err(FecError::ShardLength { expected: len, got });
            }
        }

        let sub: Vec<Vec<u8>> = available
            .iter()
            .map(|&i| self.matrix[i].clone())
            .collect();
        let decode = invert(&self.gf, &sub).ok_or(FecError::NotEnoughShards {
            have: available.len(),
            need: self.k,
        })?;

        let missing: Vec<usize> = (0..self.k).filter(|&i| shards[i].is_none()).collect();
        for d in missing {
            let mut out = vec![0u8; len];
            for (j, &src) in available.iter().enumerate() {
                let coeff = decode[d][j];
                if coeff == 0 {
                    continue;
                }
                let shard = shards[src].as_ref().unwrap();
                for (o, &b) in out.iter_mut().zip(shard.iter()) {
                    *o ^= self.gf.mul(coeff, b);
                }
            }
            shards[d] = Some(out);
        }
        Ok(())
    }
}

/// Gauss–Jordan inversion of a square matrix over GF(2^8). Returns `None`
/// if the matrix is singular.
fn invert(gf: &GfTables, matrix: &[Vec<u8>]) -> Option<Vec<Vec<u8>>> {
    let n = matrix.len();
    let mut work: Vec<Vec<u8>> = matrix
        .iter()
        .enumerate()
        .map(|(i, row)| {
            let mut extended = row.clone();
            extended.extend((0..n).map(|j| u8::from(i == j)));
            extended
        })
        .collect();

    for col in 0..n {
        let pivot = (col..n).find(|&row| work[row][col] != 0)?;
        work.swap(col, pivot);

        let inv_pivot = gf.inv(work[col][col]);
        for x in work[col].iter_mut() {
            *x = gf.mul(*x, inv_pivot);
        }

        for row in 0..n {
            if row == col || work[row][col] == 0 {
                continue;
            }
            let factor = work[row][col];
            for x in 0..2 * n {
                let sub = gf.mul(factor, work[col][x]);
                work[row][x] ^= sub;
            }
        }
    }

    Some(work.into_iter().map(|row| row[n..].to_vec()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shard_data(k: usize, len: usize) -> Vec<Vec<u8>> {
        (0..k)
            .map(|i| (0..len).map(|j| ((i * 131 + j * 17 + 5) % 251) as u8).collect())
            .collect()
    }

    #[test]
    fn test_gf_inverse() {
        let gf = GfTables::new();
        for a in 1..=255u8 {
            assert_eq!(gf.mul(a, gf.inv(a)), 1, "a = {}", a);
        }
    }

    #[test]
    fn test_systematic_matrix() {
        let rs = ReedSolomon::new(5, 3).unwrap();
        for i in 0..5 {
            for j in 0..5 {
                assert_eq!(rs.matrix[i][j], u8::from(i == j));
            }
        }
    }

    #[test]
    fn test_any_k_of_n_reconstructs() {
        let (k, r, len) = (4, 2, 64);
        let rs = ReedSolomon::new(k, r).unwrap();
        let data = shard_data(k, len);
        let refs: Vec<&[u8]> = data.iter().map(|s| s.as_slice()).collect();
        let parity = rs.encode(&refs).unwrap();

        // every pair of erasures among the six shards
        for e1 in 0..k + r {
            for e2 in e1 + 1..k + r {
                let mut shards: Vec<Option<Vec<u8>>> = data
                    .iter()
                    .cloned()
                    .map(Some)
                    .chain(parity.iter().cloned().map(Some))
                    .collect();
                shards[e1] = None;
                shards[e2] = None;

                rs.reconstruct(&mut shards).unwrap();
                for (i, original) in data.iter().enumerate() {
                    assert_eq!(shards[i].as_ref().unwrap(), original, "erasures {e1},{e2}");
                }
            }
        }
    }

    #[test]
    fn test_too_many_erasures() {
        let rs = ReedSolomon::new(4, 2).unwrap();
        let data = shard_data(4, 16);
        let refs: Vec<&[u8]> = data.iter().map(|s| s.as_slice()).collect();
        let parity = rs.encode(&refs).unwrap();

        let mut shards: Vec<Option<Vec<u8>>> = data
            .iter()
            .cloned()
            .map(Some)
            .chain(parity.into_iter().map(Some))
            .collect();
        shards[0] = None;
        shards[1] = None;
        shards[4] = None;

        let err = rs.reconstruct(&mut shards).unwrap_err();
        assert!(matches!(err, FecError::NotEnoughShards { have: 3, need: 4 }));
    }

    #[test]
    fn test_geometry_validation() {
        assert!(ReedSolomon::new(0, 1).is_err());
        assert!(ReedSolomon::new(1, 0).is_err());
        assert!(ReedSolomon::new(200, 56).is_err());
        assert!(ReedSolomon::new(200, 55).is_ok());
    }

    #[test]
    fn test_shard_length_mismatch() {
        let rs = ReedSolomon::new(2, 1).unwrap();
        let err = rs.encode(&[&[1, 2, 3], &[1, 2]]).unwrap_err();
        assert!(matches!(err, FecError::ShardLength { expected: 3, got: 2 }));
    }
}
