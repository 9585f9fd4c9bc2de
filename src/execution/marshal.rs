//! Byte copies between request pools and bound tensors.
//!
//! Encodings match bit for bit on both sides, so marshaling is a plain copy
//! with length checks. No width or byte-order conversion happens here.

use thiserror::Error;

use super::request::RequestArgument;
use crate::backend::BackendError;
use crate::memory::{MappedPool, MemoryError};

#[derive(Error, Debug)]
pub enum MarshalError {
    #[error("Argument holds {actual} bytes, tensor needs {expected}")]
    Length { expected: usize, actual: usize },

    #[error("Request has no pool {0}")]
    MissingPool(u32),

    #[error("Memory error: {0}")]
    Memory(#[from] MemoryError),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),
}

/// How rank-zero outputs with a non-empty buffer are reported.
///
/// Some backends report an empty shape for single-element results. With
/// `PromoteToRank1` such outputs are reported as `[1]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScalarShapePolicy {
    #[default]
    PromoteToRank1,
    Preserve,
}

impl ScalarShapePolicy {
    /// Shape to report for an output of `byte_len` bytes.
    pub fn report(self, shape: &[usize], byte_len: usize) -> Vec<u32> {
        if shape.is_empty() && byte_len > 0 && self == ScalarShapePolicy::PromoteToRank1 {
            return vec![1];
        }
        shape.iter().map(|&d| d as u32).collect()
    }
}

pub(crate) fn pool_mut<'a>(
    pools: &'a mut [Box<dyn MappedPool>],
    arg: &RequestArgument,
) -> Result<&'a mut Box<dyn MappedPool>, MarshalError> {
    pools
        .get_mut(arg.pool_index as usize)
        .ok_or(MarshalError::MissingPool(arg.pool_index))
}

/// Copy an input argument into a tensor's storage.
pub(crate) fn read_argument(
    pools: &[Box<dyn MappedPool>],
    arg: &RequestArgument,
    dest: &mut [u8],
) -> Result<(), MarshalError> {
    if arg.length as usize != dest.len() {
        return Err(MarshalError::Length {
            expected: dest.len(),
            actual: arg.length as usize,
        });
    }
    let pool = pools
        .get(arg.pool_index as usize)
        .ok_or(MarshalError::MissingPool(arg.pool_index))?;
    pool.read(arg.offset as usize, dest)?;
    Ok(())
}

/// Copy produced bytes into an output argument. Lengths are checked by the caller.
pub(crate) fn write_argument(
    pools: &mut [Box<dyn MappedPool>],
    arg: &RequestArgument,
    src: &[u8],
) -> Result<(), MarshalError> {
    pool_mut(pools, arg)?.write(arg.offset as usize, src)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{HostMemory, MemoryPool};

    #[test]
    fn test_rank_zero_promotion() {
        assert_eq!(ScalarShapePolicy::PromoteToRank1.report(&[], 4), vec![1]);
        assert!(ScalarShapePolicy::PromoteToRank1.report(&[], 0).is_empty());
        assert!(ScalarShapePolicy::Preserve.report(&[], 4).is_empty());
        assert_eq!(ScalarShapePolicy::Preserve.report(&[2, 3], 24), vec![2, 3]);
    }

    #[test]
    fn test_read_and_write_arguments() {
        let memory = HostMemory::from_bytes((0u8..16).collect());
        let mut pools = vec![memory.map().unwrap()];

        let mut dest = [0u8; 4];
        read_argument(&pools, &RequestArgument::new(0, 4, 4), &mut dest).unwrap();
        assert_eq!(dest, [4, 5, 6, 7]);

        let err = read_argument(&pools, &RequestArgument::new(0, 0, 3), &mut dest).unwrap_err();
        assert!(matches!(err, MarshalError::Length { expected: 4, actual: 3 }));

        write_argument(&mut pools, &RequestArgument::new(0, 12, 4), &[9, 9, 9, 9]).unwrap();
        pools[0].flush().unwrap();
        assert_eq!(&memory.to_vec()[12..], &[9, 9, 9, 9]);

        let missing = write_argument(&mut pools, &RequestArgument::new(3, 0, 1), &[0]);
        assert!(matches!(missing, Err(MarshalError::MissingPool(3))));
    }
}
