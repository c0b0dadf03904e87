use super::NodeId;
use crate::error::{IndexError, Result};
use std::fmt::Debug;

/// Random access to fixed-dimension vectors by node id. Implementations are
/// read-only while a graph is being built or searched over them.
pub trait VectorSource: Debug + Send + Sync {
    fn dimension(&self) -> usize;

    /// Number of ids `0..size()` addressable in this source.
    fn size(&self) -> usize;

    fn get_vector(&self, node: NodeId) -> Option<&[f32]>;
}

/// A `VectorSource` over an in-memory list of vectors, where the vector at
/// position `i` has node id `i`.
#[derive(Default, Debug, Clone, PartialEq)]
pub struct ListVectorSource {
    dimension: usize,
    vectors: Vec<Vec<f32>>,
}

impl ListVectorSource {
    /// Fails with `DimensionMismatch` on the first vector of the wrong length.
    pub fn new(dimension: usize, vectors: Vec<Vec<f32>>) -> Result<Self> {
        for v in vectors.iter() {
            IndexError::check_dimension(dimension, v.len())?;
        }
        Ok(Self {
            dimension,
            vectors,
        })
    }

    pub fn push(&mut self, vector: Vec<f32>) -> Result<NodeId> {
        IndexError::check_dimension(self.dimension, vector.len())?;
        self.vectors.push(vector);
        Ok((self.vectors.len() - 1) as NodeId)
    }

    pub fn vectors(&self) -> &[Vec<f32>] {
        &self.vectors
    }
}

impl VectorSource for ListVectorSource {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn size(&self) -> usize {
        self.vectors.len()
    }

    fn get_vector(&self, node: NodeId) -> Option<&[f32]> {
        self.vectors.get(node as usize).map(Vec::as_slice)
    }
}

impl<T: VectorSource + ?Sized> VectorSource for std::sync::Arc<T> {
    fn dimension(&self) -> usize {
        (**self).dimension()
    }

    fn size(&self) -> usize {
        (**self).size()
    }

    fn get_vector(&self, node: NodeId) -> Option<&[f32]> {
        (**self).get_vector(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_source() -> eyre::Result<()> {
        let mut source = ListVectorSource::new(2, vec![vec![0.0, 1.0], vec![2.0, 3.0]])?;
        assert_eq!(source.size(), 2);
        assert_eq!(source.dimension(), 2);
        assert_eq!(source.get_vector(1), Some(&[2.0f32, 3.0][..]));
        assert_eq!(source.get_vector(2), None);

        assert_eq!(source.push(vec![4.0, 5.0])?, 2);
        assert!(matches!(
            source.push(vec![1.0]),
            Err(IndexError::DimensionMismatch {
                expected: 2,
                actual: 1
            })
        ));
        Ok(())
    }

    #[test]
    fn test_mismatched_list_rejected() {
        let res = ListVectorSource::new(3, vec![vec![0.0; 3], vec![0.0; 4]]);
        assert!(matches!(res, Err(IndexError::DimensionMismatch { .. })));
    }
}
