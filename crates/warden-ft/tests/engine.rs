use std::sync::Arc;
use std::time::Duration;

use mavlink::common::{MavCmd, MavResult};
use warden_fc::sim::{SimAutopilot, SimBehavior, SimConnector};
use warden_fc::{Endpoint, PeerKind, Supervisor, SupervisorConfig};
use warden_ft::{Action, EngineConfig, TerminationEngine, TerminationError, TerminationState, Trigger};
use warden_proto::telemetry::LandedState;

const ARM_DISARM: MavCmd = MavCmd::MAV_CMD_COMPONENT_ARM_DISARM;

fn sup_config() -> SupervisorConfig {
    let mut c = SupervisorConfig::new(Endpoint::Net("udpin:sim".into()), PeerKind::Autopilot);
    c.heartbeat_interval = Duration::from_millis(50);
    c.liveness_interval = Duration::from_millis(50);
    c.heartbeat_timeout = Duration::from_millis(250);
    c.startup_timeout = Duration::from_secs(1);
    c
}

fn engine() -> TerminationEngine {
    TerminationEngine::new(EngineConfig {
        landed_query_timeout: Duration::from_millis(300),
        landing_wait_timeout: Duration::from_millis(600),
        landing_poll_interval: Duration::from_millis(50),
        ack_timeout: Duration::from_millis(300),
        action_retries: 1,
        ..Default::default()
    })
}

async fn connect(behavior: SimBehavior) -> (SimAutopilot, Supervisor) {
    let (sim, ch) = SimAutopilot::spawn(behavior);
    let sup = Supervisor::connect(sup_config(), Arc::new(SimConnector::new([Some(ch)])))
        .await
        .unwrap();
    // let a round of telemetry land in the snapshot
    tokio::time::sleep(Duration::from_millis(120)).await;
    (sim, sup)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_landed_and_armed_disarms_only() {
    let (sim, sup) = connect(SimBehavior { armed: true, landed: LandedState::OnGround, ..Default::default() }).await;
    let ft = engine();
    ft.monitor();

    let action = ft.execute(&sup.current(), Trigger::Operator).await.unwrap();

    assert_eq!(action, Some(Action::Disarm));
    assert_eq!(sim.flight_commands(), vec![ARM_DISARM]);
    assert!(!sim.behavior().armed);
    assert_eq!(ft.state(), TerminationState::Terminated);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_landed_and_disarmed_is_noop() {
    let (sim, sup) = connect(SimBehavior { armed: false, landed: LandedState::OnGround, ..Default::default() }).await;
    let ft = engine();

    let action = ft.execute(&sup.current(), Trigger::Operator).await.unwrap();

    assert_eq!(action, Some(Action::AlreadyDisarmed));
    assert!(sim.flight_commands().is_empty());
    assert_eq!(ft.state(), TerminationState::Terminated);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_airborne_low_battery_lands_then_disarms() {
    let (sim, sup) = connect(SimBehavior {
        armed: true,
        landed: LandedState::InAir,
        battery_remaining: Some(40),
        ..Default::default()
    })
    .await;
    let ft = engine();

    let action = ft.execute(&sup.current(), Trigger::ConnectionLost).await.unwrap();

    assert_eq!(action, Some(Action::LandThenDisarm));
    assert_eq!(sim.flight_commands(), vec![MavCmd::MAV_CMD_NAV_LAND, ARM_DISARM]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_airborne_unknown_battery_lands_then_disarms() {
    let (sim, sup) = connect(SimBehavior {
        armed: true,
        landed: LandedState::InAir,
        battery_remaining: None,
        ..Default::default()
    })
    .await;
    assert_eq!(sup.current().snapshot().battery_remaining, None);
    let ft = engine();

    let action = ft.execute(&sup.current(), Trigger::ConnectionLost).await.unwrap();

    assert_eq!(action, Some(Action::LandThenDisarm));
    assert!(!sim.flight_commands().contains(&MavCmd::MAV_CMD_NAV_RETURN_TO_LAUNCH));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_airborne_healthy_battery_returns_home() {
    let (sim, sup) = connect(SimBehavior {
        armed: true,
        landed: LandedState::InAir,
        battery_remaining: Some(85),
        ..Default::default()
    })
    .await;
    let ft = engine();

    let action = ft.execute(&sup.current(), Trigger::Operator).await.unwrap();

    assert_eq!(action, Some(Action::ReturnToLaunch));
    assert_eq!(sim.flight_commands(), vec![MavCmd::MAV_CMD_NAV_RETURN_TO_LAUNCH]);
    assert!(sim.behavior().armed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_missing_landed_reply_counts_as_airborne() {
    let (sim, sup) = connect(SimBehavior {
        armed: true,
        landed: LandedState::OnGround,
        answer_landed_query: false,
        battery_remaining: Some(90),
        ..Default::default()
    })
    .await;
    let ft = engine();

    let action = ft.execute(&sup.current(), Trigger::Operator).await.unwrap();

    assert_eq!(action, Some(Action::ReturnToLaunch));
    assert_eq!(sim.flight_commands(), vec![MavCmd::MAV_CMD_NAV_RETURN_TO_LAUNCH]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_landing_vehicle_is_disarmed_after_touchdown() {
    let (sim, sup) = connect(SimBehavior {
        armed: true,
        landed: LandedState::Landing,
        battery_remaining: Some(90),
        ..Default::default()
    })
    .await;
    let ft = engine();
    let session = sup.current();

    let run = ft.execute(&session, Trigger::Operator);
    let touchdown = async {
        tokio::time::sleep(Duration::from_millis(200)).await;
        sim.set(|b| b.landed = LandedState::OnGround);
    };
    let (action, ()) = tokio::join!(run, touchdown);

    assert_eq!(action.unwrap(), Some(Action::Disarm));
    assert_eq!(sim.flight_commands(), vec![ARM_DISARM]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_landing_that_never_ends_forces_land() {
    let (sim, sup) = connect(SimBehavior {
        armed: true,
        landed: LandedState::Landing,
        battery_remaining: Some(100),
        ..Default::default()
    })
    .await;
    let ft = engine();

    let action = ft.execute(&sup.current(), Trigger::Operator).await.unwrap();

    assert_eq!(action, Some(Action::LandThenDisarm));
    assert_eq!(sim.flight_commands(), vec![MavCmd::MAV_CMD_NAV_LAND, ARM_DISARM]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_rejected_action_is_retried_then_stays_executing() {
    let (sim, sup) = connect(SimBehavior {
        armed: true,
        landed: LandedState::InAir,
        battery_remaining: Some(90),
        command_result: MavResult::MAV_RESULT_DENIED,
        ..Default::default()
    })
    .await;
    let ft = engine();

    let err = ft.execute(&sup.current(), Trigger::Operator).await.unwrap_err();

    let TerminationError::Action { action, command, .. } = err;
    assert_eq!(action, Action::ReturnToLaunch);
    assert_eq!(command, "RTL");
    assert_eq!(sim.flight_commands().len(), 2);
    assert_eq!(ft.state(), TerminationState::Executing);

    // a later trigger may try again
    sim.set(|b| b.command_result = MavResult::MAV_RESULT_ACCEPTED);
    assert_eq!(
        ft.execute(&sup.current(), Trigger::Operator).await.unwrap(),
        Some(Action::ReturnToLaunch)
    );
    assert_eq!(ft.state(), TerminationState::Terminated);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_terminated_is_absorbing() {
    let (sim, sup) = connect(SimBehavior { armed: true, landed: LandedState::OnGround, ..Default::default() }).await;
    let ft = engine();

    ft.execute(&sup.current(), Trigger::Operator).await.unwrap();
    let before = sim.flight_commands().len();

    assert_eq!(ft.execute(&sup.current(), Trigger::ConnectionLost).await.unwrap(), None);
    ft.monitor();
    assert_eq!(ft.state(), TerminationState::Terminated);
    assert_eq!(sim.flight_commands().len(), before);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_connection_lost_reaches_executing_within_one_liveness_interval() {
    let (sim, ch) = SimAutopilot::spawn(SimBehavior {
        armed: true,
        landed: LandedState::InAir,
        battery_remaining: Some(90),
        ..Default::default()
    });
    // no second link: the reconnect fails
    let sup = Supervisor::connect(sup_config(), Arc::new(SimConnector::new([Some(ch)])))
        .await
        .unwrap();
    let ft = Arc::new(engine());
    ft.monitor();
    let mut states = ft.subscribe();

    sim.stop();
    let lost = tokio::time::timeout(Duration::from_secs(2), sup.run()).await.unwrap();

    let session = sup.current();
    let engine = ft.clone();
    let exec = tokio::spawn(async move { engine.execute(&session, Trigger::ConnectionLost).await });

    tokio::time::timeout(
        sup.config().liveness_interval,
        states.wait_for(|s| *s == TerminationState::Executing),
    )
    .await
    .expect("EXECUTING within one liveness interval")
    .unwrap();
    assert!(!lost.endpoint.is_empty());

    // nothing can be sent on the dead link, so the engine stays in EXECUTING
    assert!(exec.await.unwrap().is_err());
    assert_eq!(ft.state(), TerminationState::Executing);
}

/// First link dies with the vehicle airborne; the second one comes up after
/// the termination attempt already failed on the dead link.
async fn lose_then_restore(second: SimBehavior) -> (SimAutopilot, Supervisor, TerminationEngine) {
    let airborne = SimBehavior {
        armed: true,
        landed: LandedState::InAir,
        battery_remaining: Some(90),
        ..Default::default()
    };
    let (sim1, ch1) = SimAutopilot::spawn(airborne);
    let (sim2, ch2) = SimAutopilot::spawn(second);
    let sup = Supervisor::connect(sup_config(), Arc::new(SimConnector::new([Some(ch1), None, Some(ch2)])))
        .await
        .unwrap();
    let ft = engine();
    ft.monitor();

    sim1.stop();
    tokio::time::timeout(Duration::from_secs(2), sup.run()).await.unwrap();
    assert!(ft.execute(&sup.current(), Trigger::ConnectionLost).await.is_err());
    assert_eq!(ft.state(), TerminationState::Executing);

    sup.reconnect().await.unwrap();
    tokio::time::sleep(Duration::from_millis(120)).await;
    (sim2, sup, ft)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_restored_link_finishes_pending_termination() {
    let (sim2, sup, ft) = lose_then_restore(SimBehavior {
        armed: true,
        landed: LandedState::InAir,
        battery_remaining: Some(90),
        ..Default::default()
    })
    .await;

    let action = ft.link_restored(&sup.current()).await.unwrap();

    assert_eq!(action, Some(Action::ReturnToLaunch));
    assert_eq!(sim2.flight_commands(), vec![MavCmd::MAV_CMD_NAV_RETURN_TO_LAUNCH]);
    assert_eq!(ft.state(), TerminationState::Terminated);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_restored_link_returns_to_monitoring_when_retry_fails() {
    let (sim2, sup, ft) = lose_then_restore(SimBehavior {
        armed: true,
        landed: LandedState::InAir,
        battery_remaining: Some(90),
        command_result: MavResult::MAV_RESULT_DENIED,
        ..Default::default()
    })
    .await;

    assert!(ft.link_restored(&sup.current()).await.is_err());

    assert_eq!(sim2.flight_commands().len(), 2);
    assert_eq!(ft.state(), TerminationState::Monitoring);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_restored_link_without_pending_termination_only_monitors() {
    let (sim, sup) = connect(SimBehavior { armed: true, landed: LandedState::InAir, ..Default::default() }).await;
    let ft = engine();

    assert_eq!(ft.link_restored(&sup.current()).await.unwrap(), None);

    assert!(sim.flight_commands().is_empty());
    assert_eq!(ft.state(), TerminationState::Monitoring);
}
