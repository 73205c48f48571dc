// Process-wide defaults are shared by every test in a binary, so they are
// exercised from a single test here.

use qdynamics_sim::{
    Method,
    Options,
    Tolerances,
    config::{ Defaults, defaults, reset_defaults, set_defaults },
};

#[test]
fn defaults_apply_and_reset() {
    let builtin = defaults();
    assert!(builtin.cartesian_batching);
    assert_eq!(builtin.tolerances.rtol, 1e-6);

    let mut tol = builtin.tolerances;
    tol.rtol = 1e-3;
    set_defaults(Defaults { tolerances: tol, cartesian_batching: false }).unwrap();
    assert!(!Options::default().cartesian_batching);
    assert_eq!(Tolerances::default().rtol, 1e-3);
    match Method::default() {
        Method::Dopri5(tol) => assert_eq!(tol.rtol, 1e-3),
        other => panic!("unexpected default method {other:?}"),
    }
    // omitted keys follow the current defaults
    let options = Options::from_toml_str("verbose = true").unwrap();
    assert!(options.verbose && !options.cartesian_batching);

    let mut bad = tol;
    bad.atol = -1.0;
    assert!(set_defaults(Defaults { tolerances: bad, cartesian_batching: true }).is_err());
    assert_eq!(defaults().tolerances.rtol, 1e-3);

    reset_defaults();
    assert_eq!(defaults(), builtin);
}
