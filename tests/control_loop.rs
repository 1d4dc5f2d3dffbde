use std::fs;
use std::path::Path;

use scx_adapt::{
    ActivationState, Activator, Configuration, ControlLoop, Decision, ModuleId,
    StaticModuleStore, TelemetryCollector, Transition,
};

const PROFILE: &str = r#"
interval: 1000
schedulers:
  - path: lottery.bpf.c.o
    priority: 2
    criterias:
      - value_name: load_avg_1
        more_than: 5
  - path: fifo.bpf.c.o
    priority: 1
    criterias:
      - value_name: load_avg_1
        less_than: 5
"#;

#[derive(Default)]
struct Kernel {
    attached: Option<String>,
    activations: Vec<String>,
    detaches: usize,
}

impl Activator for Kernel {
    fn activate(&mut self, module: &ModuleId) -> anyhow::Result<()> {
        anyhow::ensure!(self.attached.is_none(), "a scheduler is already attached");
        self.attached = Some(module.name.clone());
        self.activations.push(module.name.clone());
        Ok(())
    }

    fn deactivate(&mut self) -> anyhow::Result<()> {
        anyhow::ensure!(self.attached.take().is_some(), "nothing attached");
        self.detaches += 1;
        Ok(())
    }
}

fn write_proc(root: &Path, load_1: f64) {
    let pressure = "some avg10=0.00 avg60=0.00 avg300=0.00 total=0\n\
                    full avg10=0.00 avg60=0.00 avg300=0.00 total=0\n";
    fs::create_dir_all(root.join("pressure")).unwrap();
    for resource in ["cpu", "io", "memory"] {
        fs::write(root.join("pressure").join(resource), pressure).unwrap();
    }
    fs::write(root.join("loadavg"), format!("{load_1:.2} 1.00 1.00 2/300 999\n")).unwrap();
    fs::write(root.join("stat"), "procs_running 2\nprocs_blocked 0\n").unwrap();
    fs::write(
        root.join("diskstats"),
        "   8       0 sda 1 0 2 3 4 0 8 2 0 5 7 0 0 0 0 0 0\n",
    )
    .unwrap();
}

fn selected_name(decision: &Decision) -> Option<&str> {
    decision.module().map(|m| m.name.as_str())
}

#[test]
fn switches_with_load_and_keeps_last_choice() {
    let proc_root = tempfile::tempdir().unwrap();
    let store = StaticModuleStore::new(["fifo.bpf.c.o", "lottery.bpf.c.o"]);
    let config = Configuration::parse(PROFILE.as_bytes(), &store).unwrap();

    // candidates are ordered by priority, not by position in the file
    let order: Vec<_> = config
        .candidates()
        .iter()
        .map(|c| c.module().name.as_str())
        .collect();
    assert_eq!(order, ["fifo.bpf.c.o", "lottery.bpf.c.o"]);

    let mut control = ControlLoop::new(
        config,
        TelemetryCollector::with_root(proc_root.path()),
        Kernel::default(),
    );

    write_proc(proc_root.path(), 2.0);
    let outcome = control.tick().unwrap();
    assert_eq!(selected_name(&outcome.decision), Some("fifo.bpf.c.o"));
    assert!(matches!(outcome.transition, Transition::Switched { from: None, .. }));

    write_proc(proc_root.path(), 2.5);
    let outcome = control.tick().unwrap();
    assert_eq!(outcome.transition, Transition::Unchanged);

    write_proc(proc_root.path(), 7.0);
    let outcome = control.tick().unwrap();
    assert_eq!(selected_name(&outcome.decision), Some("lottery.bpf.c.o"));

    // neither strict bound holds at exactly 5
    write_proc(proc_root.path(), 5.0);
    let outcome = control.tick().unwrap();
    assert_eq!(outcome.decision, Decision::NoneQualify);
    assert_eq!(outcome.transition, Transition::Unchanged);

    match control.state() {
        ActivationState::Active(module) => assert_eq!(module.name, "lottery.bpf.c.o"),
        ActivationState::Inactive => panic!("scheduler was detached on NoneQualify"),
    }
    assert_eq!(
        control.activator().activations,
        ["fifo.bpf.c.o", "lottery.bpf.c.o"]
    );
    // fifo was detached once, to make room for lottery
    assert_eq!(control.activator().detaches, 1);
    assert_eq!(control.activator().attached.as_deref(), Some("lottery.bpf.c.o"));
}

#[test]
fn unreadable_telemetry_fails_the_tick() {
    let proc_root = tempfile::tempdir().unwrap();
    let store = StaticModuleStore::new(["fifo.bpf.c.o", "lottery.bpf.c.o"]);
    let config = Configuration::parse(PROFILE.as_bytes(), &store).unwrap();
    let mut control = ControlLoop::new(
        config,
        TelemetryCollector::with_root(proc_root.path()),
        Kernel::default(),
    );

    write_proc(proc_root.path(), 2.0);
    fs::write(proc_root.path().join("loadavg"), "not a load average\n").unwrap();

    assert!(matches!(
        control.tick(),
        Err(scx_adapt::DaemonError::Collection(_))
    ));
    assert_eq!(control.state(), &ActivationState::Inactive);
    assert!(control.activator().activations.is_empty());
}
