//! End-to-end transition tests over the PV binding.
//!
//! Two machines (Human, Robot) share the README configuration and the
//! `li: [Up]` sync map, driven through the channel registry exactly the
//! way a bus frontend would. The simulated beamstop travels its
//! In <-> Out distance (38.5 units) in two seconds; the paused tokio
//! clock makes that instant in real time.

use governor::controller::MachineReport;
use governor::device::sim::SimIo;
use governor::device::DeviceIo;
use governor::pv::{device_scope, gov_scope, machine_scope, state_scope, transition_scope};
use governor::pv::{PvBinding, PvValue};
use governor::supervisor::Governor;
use governor_common::config::{DeviceConfig, GovernorConfig, SyncMap};
use governor_common::state::MachineStatus;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

const HUMAN_YML: &str = include_str!("../../config/human.yml");
const ROBOT_YML: &str = include_str!("../../config/robot.yml");

/// Beamstop velocity making the In <-> Out leg (38.5 units) take 2 s.
const BS_VELOCITY: f64 = 19.25;

struct Rig {
    gov: Arc<Governor>,
    binding: Arc<PvBinding>,
    ios: HashMap<(String, String), Arc<SimIo>>,
}

impl Rig {
    fn io(&self, machine: &str, device: &str) -> &Arc<SimIo> {
        &self.ios[&(machine.to_string(), device.to_string())]
    }

    fn write(&self, name: &str, value: PvValue) {
        self.binding
            .handle_write(name, value)
            .unwrap_or_else(|e| panic!("write to {name} refused: {e}"));
    }

    fn go(&self, machine: &str, target: &str) {
        let name = format!("{}Cmd:Go-Cmd", machine_scope("", machine));
        self.write(&name, PvValue::text(target));
    }

    fn pv(&self, name: &str) -> PvValue {
        self.binding
            .registry()
            .get(name)
            .unwrap_or_else(|| panic!("no channel named {name}"))
    }
}

fn build_rig(tweak: impl Fn(&mut GovernorConfig)) -> Rig {
    let mut human = GovernorConfig::from_yaml(HUMAN_YML).unwrap();
    let mut robot = GovernorConfig::from_yaml(ROBOT_YML).unwrap();
    tweak(&mut human);
    tweak(&mut robot);

    let mut sync = SyncMap::new();
    sync.insert("li".into(), vec!["Up".into()]);

    let mut ios: HashMap<(String, String), Arc<SimIo>> = HashMap::new();
    for name in ["Human", "Robot"] {
        ios.insert((name.into(), "dc".into()), SimIo::dummy());
        ios.insert((name.into(), "li".into()), SimIo::motor(50.0));
        ios.insert((name.into(), "bs".into()), SimIo::motor(BS_VELOCITY));
    }

    let ios_ref = ios.clone();
    let mut io_for = move |machine: &str, key: &str, _cfg: &DeviceConfig| -> Arc<dyn DeviceIo> {
        ios_ref[&(machine.to_string(), key.to_string())].clone()
    };
    let gov = Governor::build(&[human, robot], sync, &mut io_for).unwrap();
    let binding = PvBinding::new(gov.clone(), "");
    Rig { gov, binding, ios }
}

async fn wait_machine(
    rig: &Rig,
    machine: &str,
    what: &str,
    cond: impl Fn(&MachineReport) -> bool,
) -> MachineReport {
    let handle = rig.gov.machine(machine).unwrap();
    let mut rx = handle.subscribe();
    tokio::time::timeout(Duration::from_secs(120), async {
        loop {
            if cond(&rx.borrow()) {
                return rx.borrow().clone();
            }
            rx.changed().await.expect("controller alive");
        }
    })
    .await
    .unwrap_or_else(|_| panic!("{machine}: timed out waiting for {what}"))
}

async fn wait_idle_at(rig: &Rig, machine: &str, state: &str) -> MachineReport {
    wait_machine(rig, machine, &format!("Idle at {state}"), |r| {
        r.status == MachineStatus::Idle && r.state == state
    })
    .await
}

/// Let the republish tasks drain after a state change.
async fn drain() {
    tokio::time::sleep(Duration::from_millis(300)).await;
}

#[tokio::test(start_paused = true)]
async fn basic_m_to_se_runs_stages_in_order() {
    let rig = build_rig(|_| {});
    wait_idle_at(&rig, "Human", "M").await;

    rig.go("Human", "SE");
    wait_idle_at(&rig, "Human", "SE").await;
    drain().await;

    // Singleton stages execute strictly in order [dc], [li], [bs].
    let dc_seq = rig.io("Human", "dc").last_demand_seq().unwrap();
    let li_seq = rig.io("Human", "li").last_demand_seq().unwrap();
    let bs_seq = rig.io("Human", "bs").last_demand_seq().unwrap();
    assert!(dc_seq < li_seq && li_seq < bs_seq);

    let scope = machine_scope("", "Human");
    assert_eq!(rig.pv(&format!("{scope}Sts:State-I")), PvValue::text("SE"));
    assert_eq!(
        rig.pv(&format!("{scope}Sts:Reach-I")),
        PvValue::List(vec!["M".into(), "SA".into()])
    );

    // Per-state and per-transition reachability flags follow.
    let reach = |state: &str| rig.pv(&format!("{}Sts:Reach-Sts", state_scope("", "Human", state)));
    assert_eq!(reach("M"), PvValue::Number(1.0));
    assert_eq!(reach("SA"), PvValue::Number(1.0));
    assert_eq!(reach("SE"), PvValue::Number(0.0));
    assert_eq!(
        rig.pv(&format!("{}Sts:Reach-Sts", transition_scope("", "Human", "SE", "SA"))),
        PvValue::Number(1.0)
    );
    assert_eq!(
        rig.pv(&format!("{}Sts:Reach-Sts", transition_scope("", "Human", "M", "SE"))),
        PvValue::Number(0.0)
    );
}

#[tokio::test(start_paused = true)]
async fn parallel_stage_is_a_barrier() {
    let rig = build_rig(|_| {});
    wait_idle_at(&rig, "Human", "M").await;
    rig.go("Human", "SE");
    wait_idle_at(&rig, "Human", "SE").await;

    // SE -> SA: [dc, bs] in parallel, then li. The beamstop needs 2 s;
    // li must not be demanded before it arrives.
    rig.go("Human", "SA");
    wait_idle_at(&rig, "Human", "SA").await;

    let bs_t = rig.io("Human", "bs").last_demand_at().unwrap();
    let dc_t = rig.io("Human", "dc").last_demand_at().unwrap();
    let li_t = rig.io("Human", "li").last_demand_at().unwrap();
    // dc and bs belong to the same stage.
    assert!(dc_t.saturating_duration_since(bs_t) < Duration::from_millis(100));
    assert!(
        li_t.saturating_duration_since(bs_t) >= Duration::from_secs(2),
        "li started {:?} after bs",
        li_t.saturating_duration_since(bs_t)
    );
}

#[tokio::test(start_paused = true)]
async fn timeout_falls_back_to_initial_with_fault() {
    let rig = build_rig(|cfg| {
        cfg.devices.get_mut("bs").unwrap().timeout = 1.0;
    });
    wait_idle_at(&rig, "Human", "M").await;
    // The driver never clears moving(): the readback wobbles forever
    // without approaching the setpoint.
    rig.io("Human", "bs").set_phantom(true);

    let started = Instant::now();
    rig.go("Human", "SE");
    let report =
        wait_machine(&rig, "Human", "FAULT", |r| r.status == MachineStatus::Fault).await;
    let elapsed = Instant::now() - started;

    assert_eq!(report.state, "M");
    assert!(report.message.contains("bs: TIMEOUT"), "{}", report.message);
    assert!(
        elapsed >= Duration::from_secs(1) && elapsed < Duration::from_secs(4),
        "fault after {elapsed:?}"
    );

    drain().await;
    let scope = machine_scope("", "Human");
    assert_eq!(rig.pv(&format!("{scope}Sts:Status-Sts")), PvValue::text("FAULT"));
    assert_eq!(rig.pv(&format!("{scope}Sts:State-I")), PvValue::text("M"));
}

#[tokio::test(start_paused = true)]
async fn abort_returns_to_initial_without_fault() {
    let rig = build_rig(|_| {});
    wait_idle_at(&rig, "Human", "M").await;

    rig.go("Human", "SE");
    wait_machine(&rig, "Human", "Busy", |r| r.status == MachineStatus::Busy).await;
    tokio::time::sleep(Duration::from_millis(500)).await;

    // Global abort forwards to the selected machine.
    rig.write(&format!("{}Cmd:Abort-Cmd", gov_scope("")), PvValue::Number(1.0));

    let report = wait_machine(&rig, "Human", "Idle after abort", |r| {
        r.status == MachineStatus::Idle
    })
    .await;
    assert_eq!(report.state, "M");
    assert!(report.message.contains("aborted"), "{}", report.message);

    // The beamstop stopped short of its 40.0 setpoint.
    let bs = rig.gov.machine("Human").unwrap().machine.devices["bs"].snapshot();
    let pos = bs.reading.position().unwrap();
    assert!(pos < 39.0, "bs halted at {pos}");
}

#[tokio::test(start_paused = true)]
async fn update_after_propagates_through_sync() {
    let rig = build_rig(|_| {});
    wait_idle_at(&rig, "Human", "M").await;
    rig.go("Human", "SE");
    wait_idle_at(&rig, "Human", "SE").await;
    rig.go("Human", "SA");
    wait_idle_at(&rig, "Human", "SA").await;

    // Nudge the light to 7.0: inside the held window [-98, 14] around
    // Up = 0.0, so the machine stays Idle.
    rig.io("Human", "li").set_position(7.0);
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(
        rig.gov.machine("Human").unwrap().report().status,
        MachineStatus::Idle
    );

    // SA -> SE does not stage li; arrival applies updateAfter on its
    // SE binding and the new setpoint fans out to Robot.
    rig.go("Human", "SE");
    wait_idle_at(&rig, "Human", "SE").await;

    assert_eq!(rig.gov.store().get("Human", "li", "Up"), Some(7.0));
    assert_eq!(rig.gov.store().get("Robot", "li", "Up"), Some(7.0));

    drain().await;
    for machine in ["Human", "Robot"] {
        let cell = format!("{}Pos:Up-Pos", device_scope("", machine, "li"));
        assert_eq!(rig.pv(&cell), PvValue::Number(7.0), "{cell}");
    }
}

#[tokio::test(start_paused = true)]
async fn disabled_machine_rejects_go_but_keeps_publishing() {
    let rig = build_rig(|_| {});
    wait_idle_at(&rig, "Human", "M").await;

    rig.go("Robot", "SA");
    let report = wait_machine(&rig, "Robot", "rejection", |r| {
        r.message.contains("rejected")
    })
    .await;
    assert_eq!(report.status, MachineStatus::Disabled);
    assert!(report.message.contains("disabled"), "{}", report.message);

    drain().await;
    let scope = machine_scope("", "Robot");
    assert_eq!(rig.pv(&format!("{scope}Sts:Status-Sts")), PvValue::text("Disabled"));
    // The current state is still published while Disabled.
    assert_eq!(rig.pv(&format!("{scope}Sts:State-I")), PvValue::text("M"));
}

#[tokio::test(start_paused = true)]
async fn target_writes_through_the_bus_fan_out() {
    let rig = build_rig(|_| {});
    wait_idle_at(&rig, "Human", "M").await;

    let cell = format!("{}Pos:Up-Pos", device_scope("", "Human", "li"));
    rig.write(&cell, PvValue::Number(-5.0));
    assert_eq!(rig.gov.store().get("Human", "li", "Up"), Some(-5.0));
    assert_eq!(rig.gov.store().get("Robot", "li", "Up"), Some(-5.0));

    drain().await;
    let robot_cell = format!("{}Pos:Up-Pos", device_scope("", "Robot", "li"));
    assert_eq!(rig.pv(&robot_cell), PvValue::Number(-5.0));
}

#[tokio::test(start_paused = true)]
async fn config_selection_switches_the_active_machine() {
    let rig = build_rig(|_| {});
    wait_idle_at(&rig, "Human", "M").await;

    rig.write(&format!("{}Config-Sel", gov_scope("")), PvValue::text("Robot"));
    wait_idle_at(&rig, "Robot", "M").await;
    wait_machine(&rig, "Human", "Disabled", |r| r.status == MachineStatus::Disabled).await;

    // The previously disabled machine now accepts commands.
    rig.go("Robot", "SE");
    wait_idle_at(&rig, "Robot", "SE").await;
}

#[tokio::test(start_paused = true)]
async fn config_selection_is_refused_while_busy() {
    let rig = build_rig(|_| {});
    wait_idle_at(&rig, "Human", "M").await;
    rig.go("Human", "SE");
    wait_machine(&rig, "Human", "Busy", |r| r.status == MachineStatus::Busy).await;

    let err = rig
        .binding
        .handle_write(&format!("{}Config-Sel", gov_scope("")), PvValue::text("Robot"))
        .unwrap_err();
    assert!(err.to_string().contains("in progress"), "{err}");
    assert_eq!(rig.gov.selected().name(), "Human");
}

#[tokio::test(start_paused = true)]
async fn inactive_governor_disables_everything() {
    let rig = build_rig(|_| {});
    wait_idle_at(&rig, "Human", "M").await;

    rig.write(&format!("{}Active-Sel", gov_scope("")), PvValue::text("Inactive"));
    wait_machine(&rig, "Human", "Disabled", |r| r.status == MachineStatus::Disabled).await;

    rig.go("Human", "SE");
    let report = wait_machine(&rig, "Human", "rejection", |r| {
        r.message.contains("rejected")
    })
    .await;
    assert_eq!(report.status, MachineStatus::Disabled);

    rig.write(&format!("{}Active-Sel", gov_scope("")), PvValue::text("Active"));
    wait_idle_at(&rig, "Human", "M").await;
}

#[tokio::test(start_paused = true)]
async fn kill_command_raises_the_shutdown_signal() {
    let rig = build_rig(|_| {});
    wait_idle_at(&rig, "Human", "M").await;

    let mut shutdown = rig.gov.shutdown_rx();
    rig.write(&format!("{}Cmd:Kill-Cmd", gov_scope("")), PvValue::Number(1.0));
    tokio::time::timeout(Duration::from_secs(10), shutdown.changed())
        .await
        .expect("shutdown signal")
        .unwrap();
    assert!(*shutdown.borrow());
}
