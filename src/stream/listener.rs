/// Observer of one medium (audio or video) of an opened stream.
///
/// Callbacks run on the pull-loop thread of their medium and must not block
/// indefinitely: the whole fan-out for a unit waits on each of them in turn.
/// An `Err` (or a panic) is logged and does not stop delivery to the other
/// listeners.
pub trait StreamListener: Send + Sync {
    /// The source opened and this medium exists.
    fn stream_opened(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// One unit of payload: an audio chunk or the bytes of one image.
    fn stream_data(&self, data: &[u8]) -> anyhow::Result<()>;

    fn stream_started(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn stream_stopped(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn stream_closed(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Video observer. Receives the image geometry right before every image.
pub trait ImageStreamListener: StreamListener {
    fn stream_new_image_size(&self, width: u32, height: u32) -> anyhow::Result<()>;
}
