/// Fire-and-forget user-visible notifications.
///
/// Implemented by the host UI. Must never block; the core calls this from
/// async context without awaiting.
pub trait NoticeSink: Send + Sync {
    fn notify(&self, message: &str);
}
