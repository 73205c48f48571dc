use approx::{ assert_abs_diff_eq, assert_relative_eq };
use ndarray as nd;
use num_complex::Complex64 as C64;
use qdynamics_sim::{
    c,
    Error,
    GradientAlg,
    Method,
    Options,
    Problem,
    TimeOp,
    Tolerances,
    mesolve,
    sepropagator,
    sesolve,
    operators::{
        coherent_dm,
        create,
        destroy,
        fock,
        fock_dm,
        number,
        sigmam,
        sigmap,
        sigmax,
        sigmaz,
    },
    qutils::{ dag, eigh, trace },
};

fn driven_cavity(n: usize, delta: f64)
    -> (nd::Array2<C64>, Vec<nd::Array2<C64>>, nd::Array2<C64>)
{
    let a = destroy(n);
    let H = number(n) * delta + (&a + &create(n)) * 0.5;
    let Ls = vec![&a * 0.5_f64.sqrt()];
    let rho0 = coherent_dm(n, c!(0.5)).unwrap();
    (H, Ls, rho0)
}

fn max_diff<D: nd::Dimension>(a: &nd::Array<C64, D>, b: &nd::Array<C64, D>) -> f64 {
    (a - b).iter().map(|x| x.norm()).fold(0.0, f64::max)
}

fn tight() -> Method {
    Method::Dopri5(Tolerances { atol: 1e-12, rtol: 1e-10, ..Tolerances::default() })
}

#[test]
fn rouchon_keeps_states_physical() {
    let (H, Ls, rho0) = driven_cavity(5, 1.0);
    let methods = [
        Method::Rouchon1 { dt: 0.01, cholesky: false },
        Method::Rouchon1 { dt: 0.01, cholesky: true },
        Method::Rouchon15 { dt: 0.01 },
        Method::Rouchon2 { dt: 0.01 },
    ];
    for method in methods {
        let res = mesolve(
            H.clone(), Ls.clone(), rho0.clone(), vec![0.5, 1.0, 2.0], vec![],
            method, Options::default(),
        ).unwrap();
        for rho in res.states.index_axis(nd::Axis(0), 0).outer_iter() {
            assert_abs_diff_eq!(trace(&rho).re, 1.0, epsilon = 1e-10);
            let herm = (&rho + &dag(&rho)) * 0.5;
            let min_eig = eigh(&herm).unwrap().vals.fold(f64::INFINITY, |m, l| m.min(*l));
            assert!(min_eig > -1e-10, "{}: eigenvalue {min_eig}", method.name());
        }
    }
}

#[test]
fn fixed_step_convergence_order() {
    let (H, Ls, rho0) = driven_cavity(4, 1.0);
    let tsave = vec![1.0];
    let solve = |method: Method| -> nd::Array2<C64> {
        let res = mesolve(
            H.clone(), Ls.clone(), rho0.clone(), tsave.clone(), vec![],
            method, Options::default(),
        ).unwrap();
        res.final_state().index_axis(nd::Axis(0), 0).to_owned()
    };
    let exact = solve(tight());
    let err = |method: Method| max_diff(&solve(method), &exact);

    let ratio1
        = err(Method::Rouchon1 { dt: 0.01, cholesky: false })
        / err(Method::Rouchon1 { dt: 0.005, cholesky: false });
    assert!((1.7..2.3).contains(&ratio1), "Rouchon1 ratio {ratio1}");
    let ratio2
        = err(Method::Rouchon2 { dt: 0.01 })
        / err(Method::Rouchon2 { dt: 0.005 });
    assert!((3.3..4.7).contains(&ratio2), "Rouchon2 ratio {ratio2}");
}

#[test]
fn lindblad_without_dissipation_is_unitary() {
    let n = 4;
    let (H, _, _) = driven_cavity(n, 0.7);
    let psi0 = fock(n, 1).unwrap();
    let rho0 = psi0.dot(&dag(&psi0));
    let tsave = vec![0.5, 1.0];
    let me = mesolve(
        H.clone(), vec![nd::Array2::zeros((n, n))], rho0.clone(), tsave.clone(),
        vec![], tight(), Options::default(),
    ).unwrap();
    let se = sesolve(
        H.clone(), psi0, tsave, vec![], Method::Expm, Options::default(),
    ).unwrap();
    for k in 0..2 {
        let psi: nd::Array2<C64> = se.states.slice(nd::s![0, k, .., ..]).to_owned();
        let rho = me.states.slice(nd::s![0, k, .., ..]).to_owned();
        assert!(max_diff(&psi.dot(&dag(&psi)), &rho) < 1e-7);
    }
}

#[test]
fn two_level_decay() {
    let kappa: f64 = 1.0;
    let H: nd::Array2<C64> = nd::Array2::zeros((2, 2));
    let Ls = vec![sigmam() * kappa.sqrt()];
    let rho0 = fock_dm(2, 0).unwrap();
    let tsave = vec![0.5, 1.0, 1.5, 2.0];
    let pop = sigmap().dot(&sigmam());
    let cases = [
        (Method::default(), 1e-4),
        (Method::Rouchon1 { dt: 1e-3, cholesky: false }, 5e-3),
        (Method::Rouchon2 { dt: 1e-2 }, 1e-3),
    ];
    for (method, rtol) in cases {
        let res = mesolve(
            H.clone(), Ls.clone(), rho0.clone(), tsave.clone(), vec![pop.clone()],
            method, Options::default(),
        ).unwrap();
        for (k, t) in tsave.iter().enumerate() {
            assert_relative_eq!(
                res.expects[[0, 0, k]].re, (-kappa * t).exp(), max_relative = rtol);
        }
    }
}

#[test]
fn later_initial_time_shifts_solution() {
    let H: nd::Array2<C64> = nd::Array2::zeros((2, 2));
    let pop = sigmap().dot(&sigmam());
    let res = mesolve(
        H, vec![sigmam()], fock_dm(2, 0).unwrap(), vec![0.5, 1.0], vec![pop],
        Method::Rouchon2 { dt: 0.01 }, Options::default().t0(0.2),
    ).unwrap();
    assert_eq!(res.t0, 0.2);
    assert_relative_eq!(res.expects[[0, 0, 0]].re, (-0.3_f64).exp(), max_relative = 1e-3);
    assert_relative_eq!(res.expects[[0, 0, 1]].re, (-0.8_f64).exp(), max_relative = 1e-3);
}

#[test]
fn dopri5_rabi_oscillation() {
    let omega: f64 = 2.0;
    let pop = sigmap().dot(&sigmam());
    let tsave: Vec<f64> = (1..=20).map(|k| 0.25 * k as f64).collect();
    let res = sesolve(
        sigmax() * (omega / 2.0), fock(2, 0).unwrap(), tsave.clone(), vec![pop],
        Method::default(), Options::default(),
    ).unwrap();
    for (k, t) in tsave.iter().enumerate() {
        let expected = (omega * t / 2.0).cos().powi(2);
        assert_abs_diff_eq!(res.expects[[0, 0, k]].re, expected, epsilon = 1e-4);
    }
    assert!(res.stats.steps > 0);
}

#[test]
fn expm_is_exact_for_pwc() {
    let H = TimeOp::pwc(&[0.0, 0.5, 1.0], nd::array![[c!(1.0), c!(2.0)]], sigmax())
        .unwrap();
    let res = sesolve(
        H, fock(2, 0).unwrap(), vec![0.25, 1.0], vec![sigmaz()],
        Method::Expm, Options::default(),
    ).unwrap();
    // ⟨σz⟩ = cos 2θ with θ = ∫ c(t) dt
    assert_abs_diff_eq!(res.expects[[0, 0, 0]].re, (2.0 * 0.25_f64).cos(), epsilon = 1e-10);
    assert_abs_diff_eq!(res.expects[[0, 0, 1]].re, (2.0 * 1.5_f64).cos(), epsilon = 1e-10);
}

#[test]
fn cartesian_and_flat_batching() {
    let n = 3;
    let Hs: Vec<nd::Array2<C64>>
        = [0.5, 1.0, 1.5].iter().map(|d| driven_cavity(n, *d).0).collect();
    let H_batch: nd::Array3<C64>
        = nd::stack(nd::Axis(0), &Hs.iter().map(|H| H.view()).collect::<Vec<_>>())
        .unwrap();
    let (_, Ls, rho_coh) = driven_cavity(n, 1.0);
    let rho_batch: nd::Array3<C64>
        = nd::stack(nd::Axis(0), &[fock_dm(n, 0).unwrap().view(), rho_coh.view()])
        .unwrap();
    let method = Method::Rouchon2 { dt: 0.01 };
    let tsave = vec![0.5, 1.0];

    let res = mesolve(
        TimeOp::constant_batched(H_batch.clone()).unwrap(), Ls.clone(),
        rho_batch.clone(), tsave.clone(), vec![number(n)], method, Options::default(),
    ).unwrap();
    assert_eq!(res.states.dim(), (6, 2, n, n));
    assert_eq!(res.batch_shape, vec![3, 2]);
    assert_eq!(res.states_dyn().unwrap().shape(), &[3, 2, 2, n, n]);
    assert_eq!(res.expects_dyn().unwrap().shape(), &[3, 2, 1, 2]);

    // member (H index 1, state index 1) matches the unbatched run
    let single = mesolve(
        Hs[1].clone(), Ls.clone(), rho_coh.clone(), tsave.clone(), vec![number(n)],
        method, Options::default(),
    ).unwrap();
    let member = res.states.index_axis(nd::Axis(0), 3).to_owned();
    let expected = single.states.index_axis(nd::Axis(0), 0).to_owned();
    assert!(max_diff(&member, &expected) < 1e-12);

    let rho_three: nd::Array3<C64>
        = nd::stack(nd::Axis(0), &[rho_coh.view(); 3]).unwrap();
    let flat = Options::default().cartesian_batching(false);
    let res = mesolve(
        TimeOp::constant_batched(H_batch.clone()).unwrap(), Ls.clone(),
        rho_three, tsave.clone(), vec![], method, flat,
    ).unwrap();
    assert_eq!(res.batch_shape, vec![3]);
    let member = res.states.index_axis(nd::Axis(0), 1).to_owned();
    assert!(max_diff(&member, &expected) < 1e-12);

    let err = mesolve(
        TimeOp::constant_batched(H_batch).unwrap(), Ls, rho_batch, tsave, vec![],
        method, flat,
    );
    assert!(matches!(err, Err(Error::Shape(_))));
}

#[test]
fn final_state_only() {
    let (H, Ls, rho0) = driven_cavity(3, 1.0);
    let method = Method::Rouchon1 { dt: 0.01, cholesky: false };
    let all = mesolve(
        H.clone(), Ls.clone(), rho0.clone(), vec![0.5, 1.0], vec![number(3)],
        method, Options::default(),
    ).unwrap();
    let last = mesolve(
        H, Ls, rho0, vec![0.5, 1.0], vec![number(3)],
        method, Options::default().save_states(false),
    ).unwrap();
    assert_eq!(last.states.dim(), (1, 1, 3, 3));
    assert!(!last.saved_all());
    assert!(max_diff(&last.final_state().to_owned(), &all.final_state().to_owned()) < 1e-14);
    assert!(max_diff(&last.expects, &all.expects) < 1e-14);
}

#[test]
fn method_from_toml() {
    let method = Method::from_toml_str("kind = \"rouchon2\"\ndt = 0.01").unwrap();
    assert_eq!(method, Method::Rouchon2 { dt: 0.01 });
    let (H, Ls, rho0) = driven_cavity(3, 1.0);
    let options = Options::from_toml_str("save_states = false").unwrap();
    let res = mesolve(H, Ls, rho0, vec![1.0], vec![], method, options).unwrap();
    assert_eq!(res.method, method);
    assert!(!res.options.save_states);
}

#[test]
fn rouchon15_has_no_adjoint() {
    let (H, Ls, rho0) = driven_cavity(3, 1.0);
    let problem = Problem::lindblad(H, Ls, rho0, vec![1.0])
        .method(Method::Rouchon15 { dt: 0.01 });
    let res = problem.solve().unwrap();
    let ct = qdynamics_sim::Cotangent::zeros(&res);
    assert!(matches!(problem.backward(&res, &ct), Err(Error::NotImplemented(_))));
    let problem = problem.options(Options::default().gradient(GradientAlg::Adjoint));
    assert!(matches!(problem.solve(), Err(Error::NotImplemented(_))));
}

#[test]
fn propagator_matches_exponential() {
    let H1 = sigmax() * 0.7 + sigmaz() * 0.3;
    let H2 = sigmax() * 0.2 - sigmaz();
    let Hs = nd::stack![nd::Axis(0), H1, H2];
    let tsave = vec![0.5, 1.0, 1.5];
    let tight = Method::Dopri5(Tolerances { atol: 1e-12, rtol: 1e-10, ..Tolerances::default() });
    for (method, tol) in [(None, 1e-10), (Some(tight), 1e-7)] {
        let H = TimeOp::constant_batched(Hs.clone()).unwrap();
        let res = sepropagator(H, tsave.clone(), method, Options::default()).unwrap();
        assert_eq!(res.propagators.dim(), (2, 3, 2, 2));
        assert_eq!(res.propagators_dyn().unwrap().shape(), &[2, 3, 2, 2]);
        for (b, Hb) in Hs.outer_iter().enumerate() {
            let eig = eigh(&Hb).unwrap();
            for (k, t) in tsave.iter().enumerate() {
                let U = res.propagators.slice(nd::s![b, k, .., ..]);
                let expected = eig.apply(|l| c!(e -l * t));
                assert!(
                    (&U - &expected).mapv(|x| x.norm()).sum() < tol,
                    "member {b} at t = {t}",
                );
                let UdagU = dag(&U).dot(&U);
                let eye = nd::Array2::<C64>::eye(2);
                assert!((UdagU - eye).mapv(|x| x.norm()).sum() < tol);
            }
        }
    }
    // an unbatched Hamiltonian has no batch axis in the reshaped view
    let single = sepropagator(sigmaz(), vec![1.0], None, Options::default()).unwrap();
    assert!(single.batch_shape.is_empty());
    assert_eq!(single.propagators_dyn().unwrap().shape(), &[1, 2, 2]);
    assert_abs_diff_eq!(single.final_propagator()[[0, 0, 0]].re, 1.0_f64.cos(), epsilon = 1e-12);
}
