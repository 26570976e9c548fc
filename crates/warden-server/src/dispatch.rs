use std::future::Future;
use std::sync::Arc;

use tracing::{error, info, warn};
use warden_proto::command::{Reply, Request};

use crate::queue::CommandReceiver;

/// Routes one parsed operator request.
pub trait Handler: Send + Sync + 'static {
    fn handle(&self, request: Request) -> impl Future<Output = Reply> + Send;
}

/// Sole consumer of the command queue. Commands run one at a time in queue
/// order; malformed frames are answered with `ERR` and dropped.
pub struct Dispatcher<H> {
    queue: CommandReceiver,
    handler: Arc<H>,
}

impl<H: Handler> Dispatcher<H> {
    pub fn new(queue: CommandReceiver, handler: Arc<H>) -> Self {
        Self { queue, handler }
    }

    /// Runs until every sender is gone.
    pub async fn run(mut self) {
        while let Some(cmd) = self.queue.pop().await {
            let reply = match Request::parse(&cmd.payload) {
                Ok(request) => {
                    info!(client = cmd.client, seq = cmd.seq, "dispatching {}", request.name());
                    let name = request.name();
                    let handler = self.handler.clone();
                    // a panicking handler only fails this command
                    match tokio::spawn(async move { handler.handle(request).await }).await {
                        Ok(reply) => reply,
                        Err(e) => {
                            error!("{} handler failed: {}", name, e);
                            Reply::err(format!("{} failed internally", name))
                        }
                    }
                }
                Err(e) => {
                    warn!(client = cmd.client, "dropping command: {}", e);
                    Reply::err(e)
                }
            };
            if !reply.is_ok() {
                info!(client = cmd.client, seq = cmd.seq, "{}", reply.to_line().trim_end());
            }
            cmd.respond(reply).await;
        }
        info!("command queue closed, dispatcher exiting");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use bytes::Bytes;
    use tokio::sync::mpsc;
    use warden_proto::command::Priority;

    use super::*;
    use crate::queue::{channel, Command};

    #[derive(Default)]
    struct Recorder(Mutex<Vec<&'static str>>);

    impl Handler for Recorder {
        fn handle(&self, request: Request) -> impl Future<Output = Reply> + Send {
            self.0.lock().unwrap().push(request.name());
            async move {
                if request == Request::Land {
                    panic!("boom");
                }
                Reply::ok(request.name())
            }
        }
    }

    #[tokio::test]
    async fn dispatches_in_priority_order_and_rejects_garbage() {
        let (tx, rx) = channel(8);
        let (reply_tx, mut reply_rx) = mpsc::channel(8);
        for text in ["STATUS", "hello there", "ARM", "FT"] {
            let frame = Bytes::from_static(text.as_bytes());
            tx.push(Command::new(Priority::of_frame(&frame), frame, 1, Some(reply_tx.clone()))).unwrap();
        }
        drop(tx);
        drop(reply_tx);

        let handler = Arc::new(Recorder::default());
        Dispatcher::new(rx, handler.clone()).run().await;

        assert_eq!(*handler.0.lock().unwrap(), ["TERMINATE", "ARM", "STATUS"]);
        let mut replies = Vec::new();
        while let Some(r) = reply_rx.recv().await {
            replies.push(r);
        }
        assert_eq!(replies[0], Reply::ok("TERMINATE"));
        assert_eq!(replies[1], Reply::ok("ARM"));
        // STATUS and the unknown frame share Low; arrival order decides
        assert_eq!(replies[2], Reply::ok("STATUS"));
        assert_eq!(replies[3], Reply::err("unknown command `HELLO`"));
    }

    #[tokio::test]
    async fn panicking_handler_does_not_stop_dispatch() {
        let (tx, rx) = channel(8);
        let (reply_tx, mut reply_rx) = mpsc::channel(8);
        for text in ["LAND", "ARM"] {
            let frame = Bytes::from_static(text.as_bytes());
            tx.push(Command::new(Priority::Normal, frame, 1, Some(reply_tx.clone()))).unwrap();
        }
        drop(tx);
        drop(reply_tx);

        Dispatcher::new(rx, Arc::new(Recorder::default())).run().await;

        assert_eq!(reply_rx.recv().await, Some(Reply::err("LAND failed internally")));
        assert_eq!(reply_rx.recv().await, Some(Reply::ok("ARM")));
    }
}
