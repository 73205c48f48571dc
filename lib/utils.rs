//! Miscellaneous helpers.

/// Shorthand for constructing a [`num_complex::Complex64`].
///
/// ```
/// # use qdynamics_sim::c;
/// use num_complex::Complex64 as C64;
/// assert_eq!(c!(1.0), C64::new(1.0, 0.0));
/// assert_eq!(c!(i 2.0), C64::new(0.0, 2.0));
/// assert_eq!(c!(1.0, 2.0), C64::new(1.0, 2.0));
/// assert_eq!(c!(e 0.0), C64::new(1.0, 0.0));
/// ```
#[macro_export]
macro_rules! c {
    ( i $im:expr ) => {
        $crate::num_complex::Complex64::new(0.0, $im)
    };
    ( e $ph:expr ) => {
        $crate::num_complex::Complex64::cis($ph)
    };
    ( $re:expr, $im:expr ) => {
        $crate::num_complex::Complex64::new($re, $im)
    };
    ( $re:expr ) => {
        $crate::num_complex::Complex64::new($re, 0.0)
    };
}

/// `numpy.isclose` with its default tolerances.
pub(crate) fn isclose(a: f64, b: f64) -> bool {
    (a - b).abs() <= 1e-8 + 1e-5 * b.abs()
}

/// Insert `x` into the sorted vector `v` unless an equal value is already
/// present.
pub(crate) fn insert_sorted_unique(v: &mut Vec<f64>, x: f64) {
    match v.binary_search_by(|y| y.total_cmp(&x)) {
        Ok(_) => { },
        Err(k) => { v.insert(k, x); },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sorted_insert() {
        let mut v = vec![0.0, 1.0];
        insert_sorted_unique(&mut v, 0.5);
        insert_sorted_unique(&mut v, 1.0);
        insert_sorted_unique(&mut v, 2.0);
        assert_eq!(v, vec![0.0, 0.5, 1.0, 2.0]);
    }

    #[test]
    fn close() {
        assert!(isclose(3.0, 3.0 + 1e-9));
        assert!(!isclose(3.0, 3.01));
    }
}
