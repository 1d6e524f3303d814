use std::sync::Arc;

use crate::buffer::Buffer;
use crate::connection::Connection;
use crate::time::Timestamp;

/// Fires once, in both directions, whenever a connection is established or
/// about to be torn down.
pub type ConnectionCallback = Arc<dyn Fn(&Connection) + Send + Sync>;
/// Fires whenever bytes land in a connection's input buffer; `buf` holds
/// everything read so far and the callback is expected to `retrieve` only
/// what it can make sense of, leaving the rest for the next delivery.
pub type MessageCallback = Arc<dyn Fn(&Connection, &mut Buffer, Timestamp) + Send + Sync>;
/// Fires once the output buffer has fully drained after previously crossing
/// the high-water mark, i.e. when it is safe to resume producing data.
pub type WriteCompleteCallback = Arc<dyn Fn(&Connection) + Send + Sync>;
/// Fires the moment the output buffer's length crosses the high-water mark
/// on its way up, so a producer can be told to slow down.
pub type HighWaterMarkCallback = Arc<dyn Fn(&Connection, usize) + Send + Sync>;
/// Fires once, after the connection callback, right before the connection is
/// dropped from whatever owns it (the server's or client's bookkeeping).
pub type CloseCallback = Arc<dyn Fn(&Connection) + Send + Sync>;

/// Logs the connection's up/down transition; installed by default so a
/// server or client that never bothers to set one still produces a
/// breadcrumb in the log.
pub fn default_connection_callback(conn: &Connection) {
    log::info!(
        "{} -> {} is {}",
        conn.local_addr(),
        conn.peer_addr(),
        if conn.connected() { "UP" } else { "DOWN" }
    );
}

/// Discards whatever arrived. A connection with no message callback of its
/// own would otherwise accumulate forever in its input buffer.
pub fn default_message_callback(_conn: &Connection, buf: &mut Buffer, _receive_time: Timestamp) {
    buf.retrieve_all();
}

pub(crate) fn default_connection_callback_arc() -> ConnectionCallback {
    Arc::new(default_connection_callback)
}

pub(crate) fn default_message_callback_arc() -> MessageCallback {
    Arc::new(default_message_callback)
}
