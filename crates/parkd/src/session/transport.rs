//! Transport operations a session can start.
//!
//! Each `start_*` call returns immediately. The transport later posts
//! exactly one completion for the given tag to the reactor, with `ok =
//! false` if the operation failed or the stream is gone.

use super::Tag;

/// Outbound half of a stream.
pub trait StreamSink<T>: Send + Sync {
    /// Begins sending one message.
    fn start_write(&self, tag: Tag, message: T);

    /// Begins closing the stream with a success status.
    fn start_finish(&self, tag: Tag);

    /// True once the peer is gone or the stream was torn down.
    fn is_cancelled(&self) -> bool;

    /// Asks the transport to report cancellation to the reactor.
    ///
    /// Called once when the session binds to the stream. The transport
    /// posts a done notice for `tag` when it is torn down, which lets the
    /// reactor reclaim sessions that have no operation in flight.
    fn notify_when_done(&self, tag: Tag);
}

/// Inbound half of a stream.
pub trait StreamSource<In>: Send + Sync {
    /// Begins reading one message.
    fn start_read(&self, tag: Tag);

    /// Takes the message delivered by the last successful read.
    fn take_read(&self) -> Option<In>;
}

/// A stream that carries `In` frames from the client and `Out` frames to it.
pub trait DuplexTransport<In, Out>: StreamSink<Out> + StreamSource<In> {}

impl<X, In, Out> DuplexTransport<In, Out> for X where X: StreamSink<Out> + StreamSource<In> {}
