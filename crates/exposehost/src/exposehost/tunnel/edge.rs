/// Publishes http tunnels to whatever terminates public HTTPS in front of the workers.
///
/// Each method is called exactly once per activation / teardown of an http tunnel.
pub trait EdgeRouter: Send + Sync {
    fn publish_route(&self, hostname: &str, port: u16);
    fn withdraw_route(&self, hostname: &str);
}

/// Default router: records route changes in the log only.
#[derive(Debug, Default)]
pub struct LogEdgeRouter;

impl EdgeRouter for LogEdgeRouter {
    fn publish_route(&self, hostname: &str, port: u16) {
        tracing::info!(hostname = %hostname, port, "edge: publish route");
    }

    fn withdraw_route(&self, hostname: &str) {
        tracing::info!(hostname = %hostname, "edge: withdraw route");
    }
}
