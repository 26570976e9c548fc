use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};
use warden_fc::state::LinkStatus;
use warden_fc::{ProtocolError, Supervisor};
use warden_ft::{TerminationEngine, TerminationState, Trigger};
use warden_mission::{load_plan_file, MissionUploader};
use warden_proto::command::{PlanSource, Reply, Request};
use warden_proto::mission::Mission;

use crate::dispatch::Handler;

#[derive(Serialize)]
struct Status {
    link: LinkStatus,
    termination: TerminationState,
}

/// Routes operator requests to the supervisor's current session, the mission
/// uploader and the termination engine. Failures are reported to the client
/// and never touch the link.
pub struct FlightHandler {
    supervisor: Arc<Supervisor>,
    engine: Arc<TerminationEngine>,
    uploader: MissionUploader,
    ack_timeout: Duration,
}

impl FlightHandler {
    pub fn new(
        supervisor: Arc<Supervisor>,
        engine: Arc<TerminationEngine>,
        uploader: MissionUploader,
        ack_timeout: Duration,
    ) -> Self {
        Self { supervisor, engine, uploader, ack_timeout }
    }

    async fn route(&self, request: Request) -> Reply {
        let session = self.supervisor.current();
        let t = self.ack_timeout;
        match request {
            Request::Terminate => match self.engine.execute(&session, Trigger::Operator).await {
                Ok(Some(action)) => Reply::ok(format!("terminated: {:?}", action)),
                Ok(None) => Reply::ok("already terminated"),
                Err(e) => Reply::err(e),
            },
            Request::ReturnToLaunch => acked("RTL", session.return_to_launch(t).await),
            Request::Land => acked("LAND", session.land(t).await),
            Request::Arm => acked("ARM", session.arm(t).await),
            Request::Takeoff { alt_m } => acked("TAKEOFF", session.takeoff(alt_m, t).await),
            Request::StartMission => acked("START_MISSION", session.start_mission(t).await),
            Request::MissionPlan(source) => {
                let mission = match source {
                    PlanSource::Path(path) => load_plan_file(&path).await.map_err(|e| e.to_string()),
                    PlanSource::Inline(waypoints) => Mission::from_waypoints(&waypoints).map_err(|e| e.to_string()),
                };
                let mission = match mission {
                    Ok(m) => m,
                    Err(e) => {
                        warn!("bad mission plan: {}", e);
                        return Reply::err(e);
                    }
                };
                match self.uploader.upload(&session, &mission).await {
                    Ok(ack) if ack.is_accepted() => Reply::ok(format!("mission accepted ({} items)", ack.items)),
                    Ok(ack) => Reply::err(format!("mission rejected: {:?}", ack.result)),
                    Err(e) => {
                        warn!("mission upload failed: {}", e);
                        Reply::err(format!("mission upload failed: {}", e))
                    }
                }
            }
            Request::Status => {
                let status = Status { link: self.supervisor.status(), termination: self.engine.state() };
                match serde_json::to_string(&status) {
                    Ok(json) => Reply::ok(json),
                    Err(e) => Reply::err(e),
                }
            }
        }
    }
}

fn acked(what: &str, result: Result<(), ProtocolError>) -> Reply {
    match result {
        Ok(()) => {
            info!("{} acknowledged", what);
            Reply::ok(what)
        }
        Err(e) => {
            warn!("{} failed: {}", what, e);
            Reply::err(format!("{}: {}", what, e))
        }
    }
}

impl Handler for FlightHandler {
    fn handle(&self, request: Request) -> impl Future<Output = Reply> + Send {
        self.route(request)
    }
}
