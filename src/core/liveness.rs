//! Caller liveness: death notification for remote callback objects.

use log::debug;
use tokio::sync::mpsc::UnboundedSender;

use crate::Message;

/// Signifies that the object may be a proxy to a remote RPC object.
///
/// Such an object can disappear at any time when its owning process dies. Observers registered
/// with `register_disconnect` are invoked exactly once when that happens.
pub trait RPCProxy {
    /// Registers a disconnect observer. Returns the id of the observer, or an error if the
    /// remote end is already gone.
    fn register_disconnect(&self, f: Box<dyn Fn() + Send>) -> anyhow::Result<u32>;

    /// Stops watching. Returns false if there was no such observer.
    fn unregister(&self, id: u32) -> bool;

    /// Returns the ID of the object. For example this would be an object path in D-Bus RPC.
    fn get_object_id(&self) -> String;
}

/// Watches `proxy` and posts the message built by `message` to the dispatch loop when it
/// disconnects.
///
/// The returned id must be handed back to `unlink_to_death` once the registration ends.
pub fn link_to_death<P, F>(
    proxy: &P,
    tx: &UnboundedSender<Message>,
    message: F,
) -> anyhow::Result<u32>
where
    P: RPCProxy + ?Sized,
    F: Fn() -> Message + Send + 'static,
{
    let tx = tx.clone();
    let object_id = proxy.get_object_id();
    proxy.register_disconnect(Box::new(move || {
        debug!("Remote object {} died", object_id);
        // The dispatch loop may already be gone during shutdown.
        let _ = tx.send(message());
    }))
}

/// Stops the death watch started by `link_to_death`. Tolerates links that were never made.
pub fn unlink_to_death<P: RPCProxy + ?Sized>(proxy: &P, link: Option<u32>) {
    if let Some(id) = link {
        if !proxy.unregister(id) {
            debug!("Death link {} of {} was already gone", id, proxy.get_object_id());
        }
    }
}
