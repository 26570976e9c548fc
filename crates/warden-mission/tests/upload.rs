use std::sync::Arc;
use std::time::Duration;

use mavlink::common::{MavCmd, MavMessage, MavMissionResult};
use warden_fc::sim::{SimAutopilot, SimBehavior, SimConnector};
use warden_fc::{Endpoint, PeerKind, ProtocolError, Supervisor, SupervisorConfig};
use warden_mission::{MissionUploader, UploadConfig};
use warden_proto::mission::{Mission, Waypoint};

async fn connect(behavior: SimBehavior) -> (SimAutopilot, Supervisor) {
    let (sim, ch) = SimAutopilot::spawn(behavior);
    let cfg = SupervisorConfig::new(Endpoint::Net("udpin:sim".into()), PeerKind::Autopilot);
    let sup = Supervisor::connect(cfg, Arc::new(SimConnector::new([Some(ch)])))
        .await
        .unwrap();
    (sim, sup)
}

fn three_items() -> Mission {
    Mission::from_waypoints(&[
        Waypoint { lat: 49.8142336, lon: -97.1205414, alt_m: 20.0 },
        Waypoint { lat: 49.8122997, lon: -97.1186914, alt_m: 20.0 },
        Waypoint { lat: 49.8133112, lon: -97.1170021, alt_m: 25.0 },
    ])
    .unwrap()
}

fn uploader(step_ms: u64) -> MissionUploader {
    MissionUploader::new(UploadConfig { step_timeout: Duration::from_millis(step_ms), home: None })
}

fn counts(sim: &SimAutopilot) -> Vec<u16> {
    sim.received()
        .into_iter()
        .filter_map(|m| match m {
            MavMessage::MISSION_COUNT(c) => Some(c.count),
            _ => None,
        })
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_three_item_upload_accepted() {
    let (sim, sup) = connect(SimBehavior::default()).await;

    let ack = uploader(1000).upload(&sup.current(), &three_items()).await.unwrap();

    assert!(ack.is_accepted());
    assert_eq!(ack.items, 3);
    assert_eq!(sim.mission_items(), vec![0, 1, 2]);
    assert_eq!(counts(&sim), vec![3]);
    let cleared = sim.received().iter().filter(|m| matches!(m, MavMessage::MISSION_CLEAR_ALL(_))).count();
    assert_eq!(cleared, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_missing_ack_times_out_and_session_survives() {
    let (sim, sup) = connect(SimBehavior { ack_mission: false, ..Default::default() }).await;
    let session = sup.current();

    let err = uploader(300).upload(&session, &three_items()).await.unwrap_err();
    assert!(matches!(err, ProtocolError::Timeout { waiting_for: "MISSION_ACK", .. }), "{err}");
    assert_eq!(sim.mission_items(), vec![0, 1, 2]);

    // the link is untouched by a failed upload
    assert!(!session.is_closed());
    assert!(session.is_alive());
    sim.set(|b| b.ack_mission = true);
    assert!(uploader(1000).upload(&session, &three_items()).await.unwrap().is_accepted());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_no_item_requests_times_out() {
    let (_sim, sup) = connect(SimBehavior { serve_mission: false, ..Default::default() }).await;

    let err = uploader(200).upload(&sup.current(), &three_items()).await.unwrap_err();
    assert!(matches!(err, ProtocolError::Timeout { waiting_for: "MISSION_REQUEST", .. }), "{err}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_uploading_twice_runs_two_independent_cycles() {
    let (sim, sup) = connect(SimBehavior::default()).await;
    let up = uploader(1000);
    let mission = three_items();

    assert!(up.upload(&sup.current(), &mission).await.unwrap().is_accepted());
    assert!(up.upload(&sup.current(), &mission).await.unwrap().is_accepted());

    assert_eq!(counts(&sim), vec![3, 3]);
    assert_eq!(sim.mission_items(), vec![0, 1, 2, 0, 1, 2]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_requests_answered_in_the_order_asked() {
    let (sim, sup) = connect(SimBehavior {
        request_order: Some(vec![2, 0, 7, 1]),
        use_int_requests: false,
        ..Default::default()
    })
    .await;

    let ack = uploader(1000).upload(&sup.current(), &three_items()).await.unwrap();

    assert!(ack.is_accepted());
    // 7 is out of range and dropped
    assert_eq!(sim.mission_items(), vec![2, 0, 1]);
    let legacy = sim.received().iter().filter(|m| matches!(m, MavMessage::MISSION_ITEM(_))).count();
    assert_eq!(legacy, 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_rejection_is_surfaced() {
    let (_sim, sup) = connect(SimBehavior {
        mission_result: MavMissionResult::MAV_MISSION_NO_SPACE,
        ..Default::default()
    })
    .await;

    let ack = uploader(1000).upload(&sup.current(), &three_items()).await.unwrap();
    assert!(!ack.is_accepted());
    assert_eq!(ack.result, MavMissionResult::MAV_MISSION_NO_SPACE);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_home_is_set_first() {
    let (sim, sup) = connect(SimBehavior::default()).await;
    let up = MissionUploader::new(UploadConfig {
        step_timeout: Duration::from_secs(1),
        home: Some(Waypoint { lat: 49.81, lon: -97.12, alt_m: 231.0 }),
    });

    assert!(up.upload(&sup.current(), &three_items()).await.unwrap().is_accepted());

    let first_mission_msg = sim
        .received()
        .into_iter()
        .position(|m| matches!(m, MavMessage::MISSION_CLEAR_ALL(_)))
        .unwrap();
    let set_home = sim
        .received()
        .into_iter()
        .position(|m| matches!(m, MavMessage::COMMAND_INT(ref c) if c.command == MavCmd::MAV_CMD_DO_SET_HOME))
        .unwrap();
    assert!(set_home < first_mission_msg);
    match &sim.received()[set_home] {
        MavMessage::COMMAND_INT(c) => {
            assert_eq!(c.x, 498_100_000);
            assert_eq!(c.y, -971_200_000);
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_endless_repeated_requests_hit_the_overall_deadline() {
    // keeps asking for item 0, never acks
    let (sim, sup) = connect(SimBehavior { request_order: Some(vec![0; 100_000]), ..Default::default() }).await;
    let started = std::time::Instant::now();

    let err = uploader(100).upload(&sup.current(), &three_items()).await.unwrap_err();

    assert!(matches!(err, ProtocolError::Timeout { waiting_for: "MISSION_REQUEST", .. }), "{err}");
    assert!(started.elapsed() < Duration::from_secs(2), "took {:?}", started.elapsed());
    assert!(sim.mission_items().len() > 3);
    assert!(!sup.current().is_closed());
}
