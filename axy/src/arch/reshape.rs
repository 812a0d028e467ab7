use ndarray::Array2;

/// Reuses an owned matrix's allocation for a new shape.
///
/// The contents after reshaping are unspecified, callers overwrite every element.
pub trait InplaceReshape {
    fn into_reshape(self, shape: (usize, usize)) -> Self;
}

impl<T: Clone + Default> InplaceReshape for Array2<T> {
    fn into_reshape(self, shape: (usize, usize)) -> Self {
        if self.dim() == shape {
            return self;
        }

        let (mut raw, _) = self.into_raw_vec_and_offset();
        raw.resize(shape.0 * shape.1, T::default());
        Array2::from_shape_vec(shape, raw).unwrap_or_else(|_| Array2::from_elem(shape, T::default()))
    }
}
