//! Stream handles: one published output of a media.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use super::transport::{LowerTransport, Transport};
use crate::address_pool::AddressPool;
use crate::error::{MediaError, Result};
use crate::pipeline::{Element, Pad, Pipeline, State};

struct StreamInner {
    address_pool: Option<Arc<dyn AddressPool>>,
    protocols: LowerTransport,
    joined: bool,
    transports: Vec<(u64, Transport)>,
}

/// An elementary stream of a media.
///
/// `index` is the position at which the stream was discovered. `srcpad` is
/// the pad published on the media's bin; `payloader` is the element
/// producing the data behind it.
pub struct Stream {
    index: usize,
    payloader: Arc<dyn Element>,
    srcpad: Pad,
    inner: Mutex<StreamInner>,
}

impl Stream {
    pub fn new(index: usize, payloader: Arc<dyn Element>, srcpad: Pad) -> Self {
        Self {
            index,
            payloader,
            srcpad,
            inner: Mutex::new(StreamInner {
                address_pool: None,
                protocols: LowerTransport::default(),
                joined: false,
                transports: Vec::new(),
            }),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn payloader(&self) -> &Arc<dyn Element> {
        &self.payloader
    }

    pub fn srcpad(&self) -> &Pad {
        &self.srcpad
    }

    /// Link this stream's delivery branch behind `rtpbin`, bringing the new
    /// elements to `state`.
    pub fn join_bin(
        &self,
        pipeline: &dyn Pipeline,
        rtpbin: &Arc<dyn Element>,
        state: State,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.joined {
            return Ok(());
        }
        tracing::debug!(stream = self.index, pad = %self.srcpad, %state, "join bin");
        if !pipeline.join_stream(self, rtpbin, state) {
            tracing::warn!(stream = self.index, "failed to link stream");
            return Err(MediaError::StreamLink(self.index));
        }
        inner.joined = true;
        Ok(())
    }

    /// Undo [`join_bin`](Self::join_bin). Returns `false` if the stream was
    /// not joined.
    pub fn leave_bin(&self, pipeline: &dyn Pipeline, rtpbin: &Arc<dyn Element>) -> bool {
        let mut inner = self.inner.lock();
        if !inner.joined {
            return false;
        }
        tracing::debug!(stream = self.index, "leave bin");
        pipeline.leave_stream(self, rtpbin);
        inner.joined = false;
        inner.transports.clear();
        true
    }

    pub fn is_joined(&self) -> bool {
        self.inner.lock().joined
    }

    pub fn set_address_pool(&self, pool: Option<Arc<dyn AddressPool>>) {
        self.inner.lock().address_pool = pool;
    }

    pub fn address_pool(&self) -> Option<Arc<dyn AddressPool>> {
        self.inner.lock().address_pool.clone()
    }

    /// Server (RTP, RTCP) ports for a new client transport, from the
    /// attached address pool.
    pub fn allocate_ports(&self) -> Option<(u16, u16)> {
        let pool = self.address_pool()?;
        pool.acquire_ports()
    }

    pub fn set_protocols(&self, protocols: LowerTransport) {
        self.inner.lock().protocols = protocols;
    }

    pub fn protocols(&self) -> LowerTransport {
        self.inner.lock().protocols
    }

    pub(crate) fn add_transport(&self, id: u64, transport: Transport) {
        self.inner.lock().transports.push((id, transport));
    }

    pub(crate) fn remove_transport(&self, id: u64) {
        self.inner.lock().transports.retain(|(t, _)| *t != id);
    }

    /// Number of currently active client transports.
    pub fn n_transports(&self) -> usize {
        self.inner.lock().transports.len()
    }

    /// Active client transports.
    pub fn transports(&self) -> Vec<Transport> {
        self.inner
            .lock()
            .transports
            .iter()
            .map(|(_, t)| t.clone())
            .collect()
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Stream")
            .field("index", &self.index)
            .field("payloader", &self.payloader.name())
            .field("srcpad", &self.srcpad)
            .field("protocols", &inner.protocols)
            .field("joined", &inner.joined)
            .field("transports", &inner.transports.len())
            .finish()
    }
}
