mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use common::FixedMechanism;
use nalgebra::{DVector, dvector};
use vmblend::error::{LifecycleError, ModelError};
use vmblend::guide::blend::ProbMode;
use vmblend::guide::lifecycle::{
    BuiltMechanism, InsertRequest, InsertSource, LifecycleScheduler, MechanismFactory,
};
use vmblend::guide::manager::{Manager, ManagerConfig, MechanismTarget};

struct FixedFactory;

impl MechanismFactory for FixedFactory {
    fn build(&self, _request: &InsertRequest) -> Result<BuiltMechanism, ModelError> {
        Ok(BuiltMechanism {
            vm: FixedMechanism::new(dvector![0.5, 0.5], 0.3).boxed(),
            use_active_guide: true,
        })
    }
}

#[test]
fn structural_changes_during_control_loop_stay_consistent() {
    let east = FixedMechanism::new(dvector![1.0, 0.0], 0.6);
    let north = FixedMechanism::new(dvector![0.0, 1.0], 0.4);
    let east_updates = Arc::clone(&east.updates);
    let north_updates = Arc::clone(&north.updates);
    let mgr = Arc::new(
        Manager::new(
            ManagerConfig::new(2, ProbMode::Hard),
            vec![(east.boxed(), true), (north.boxed(), true)],
        )
        .expect("manager"),
    );
    let sched = LifecycleScheduler::new(Arc::clone(&mgr), Arc::new(FixedFactory)).expect("scheduler");
    let done = Arc::new(AtomicBool::new(false));

    let control = {
        let mgr = Arc::clone(&mgr);
        let done = Arc::clone(&done);
        thread::Builder::new()
            .name("control".into())
            .spawn(move || {
                let mut cycles = 0u64;
                while !done.load(Ordering::Acquire) {
                    let f = mgr.update(&dvector![0.1, 0.2], &DVector::zeros(2), 0.002, false, true);
                    assert!(f.iter().all(|v| v.is_finite()));
                    assert!(mgr.snapshot().is_consistent());
                    cycles += 1;
                }
                cycles
            })
            .expect("spawn control")
    };

    for _ in 0..50 {
        let id = sched
            .insert(InsertSource::Samples(nalgebra::DMatrix::zeros(1, 2)))
            .expect("accepted")
            .wait()
            .expect("finished")
            .expect("inserted");
        assert!(mgr.snapshot().is_consistent());
        sched
            .delete(MechanismTarget::Id(id))
            .expect("accepted")
            .wait()
            .expect("finished")
            .expect("deleted");
    }
    done.store(true, Ordering::Release);
    let cycles = control.join().expect("control thread panicked");

    assert!(cycles > 0);
    // every cycle reached both original mechanisms, whatever was inserted or removed meanwhile
    assert_eq!(east_updates.load(Ordering::Relaxed) as u64, cycles);
    assert_eq!(north_updates.load(Ordering::Relaxed) as u64, cycles);
    assert_eq!(mgr.stats().cycles, cycles);
    assert_eq!(mgr.count(), 2);
    let snap = mgr.snapshot();
    assert!(snap.is_consistent());
    assert_eq!(snap.ids, vec![0, 1]);
    let sum: f64 = snap.scales.iter().sum();
    assert!((sum - 1.0).abs() < 1e-9 || sum == 0.0);
}

#[test]
fn deleting_an_already_removed_id_is_reported() {
    let mgr = Arc::new(
        Manager::new(
            ManagerConfig::new(2, ProbMode::Hard),
            vec![
                (FixedMechanism::new(dvector![1.0, 0.0], 0.6).boxed(), true),
                (FixedMechanism::new(dvector![0.0, 1.0], 0.4).boxed(), true),
                (FixedMechanism::new(dvector![1.0, 1.0], 0.4).boxed(), true),
            ],
        )
        .expect("manager"),
    );
    let sched = LifecycleScheduler::new(Arc::clone(&mgr), Arc::new(FixedFactory)).expect("scheduler");
    let first = sched
        .delete(MechanismTarget::Id(1))
        .expect("accepted")
        .wait()
        .expect("finished");
    assert_eq!(first.ok(), Some(1));
    let again = sched
        .delete(MechanismTarget::Id(1))
        .expect("accepted")
        .wait()
        .expect("finished");
    assert!(matches!(again, Err(LifecycleError::UnknownId(1))));
    assert_eq!(mgr.count(), 2);
}

#[test]
fn random_inserts_and_deletes_keep_vectors_aligned() {
    use rand::Rng;

    let mgr = Arc::new(
        Manager::new(
            ManagerConfig::new(2, ProbMode::Soft),
            vec![(FixedMechanism::new(dvector![1.0, 0.0], 0.6).boxed(), true)],
        )
        .expect("manager"),
    );
    let sched = LifecycleScheduler::new(Arc::clone(&mgr), Arc::new(FixedFactory)).expect("scheduler");
    let done = Arc::new(AtomicBool::new(false));
    let control = {
        let mgr = Arc::clone(&mgr);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            while !done.load(Ordering::Acquire) {
                mgr.update(&dvector![0.0, 0.0], &DVector::zeros(2), 0.002, false, true);
            }
        })
    };

    let mut rng = rand::rng();
    let mut expected = 1usize;
    for _ in 0..100 {
        if rng.random_bool(0.5) {
            let res = sched
                .insert(InsertSource::Samples(nalgebra::DMatrix::zeros(1, 2)))
                .expect("accepted")
                .wait()
                .expect("finished");
            assert!(res.is_ok());
            expected += 1;
        } else {
            let index = rng.random_range(0..expected);
            let res = sched
                .delete(MechanismTarget::Index(index))
                .expect("accepted")
                .wait()
                .expect("finished");
            match res {
                Ok(_) => expected -= 1,
                Err(LifecycleError::LastMechanism) => assert_eq!(expected, 1),
                Err(err) => panic!("unexpected delete failure: {err}"),
            }
        }
        let snap = mgr.snapshot();
        assert!(snap.is_consistent());
        assert_eq!(snap.len(), expected);
    }
    done.store(true, Ordering::Release);
    control.join().expect("control thread panicked");
}
