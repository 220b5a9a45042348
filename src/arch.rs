use crate::result::*;

/// A checked cast from u64 to usize
///
/// We could use the `cast` crate,
/// (https://docs.rs/cast/0.2.3/cast/)
/// but this is the only one we really need.
pub fn usize<I: Into<u64>>(i: I) -> ZipResult<usize> {
    let i: u64 = i.into();
    usize::try_from(i).map_err(|_| ZipError::InsufficientAddressSpace)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn small_values_fit() {
        assert_eq!(usize(0u16).unwrap(), 0);
        assert_eq!(usize(u32::MAX).unwrap(), u32::MAX as usize);
    }

    #[test]
    #[cfg(target_pointer_width = "32")]
    fn large_values_dont_fit() {
        assert!(matches!(
            usize(u64::MAX),
            Err(ZipError::InsufficientAddressSpace)
        ));
    }
}
