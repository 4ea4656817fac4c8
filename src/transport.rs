//! Message delivery between address spaces.
//!
//! The runtime only needs [`Transport::send`]; delivery order between a pair
//! of spaces must be FIFO. [`LocalNetwork`] connects runtimes living in one
//! process, framing every message through [`crate::wire`]. It either delivers
//! on the sending thread ([`DeliveryMode::Inline`]) or queues messages until
//! [`LocalNetwork::pump`] is called ([`DeliveryMode::Queued`]), which lets
//! tests observe in-flight protocol states.

use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Weak;

use parking_lot::Mutex;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::error::Error;
use crate::error::Result;
use crate::message::Message;
use crate::primitives::AddressSpace;
use crate::runtime::Runtime;
use crate::wire;

pub trait Transport: Send + Sync {
    fn send(&self, source: AddressSpace, target: AddressSpace, message: Message);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Deliver on the sending thread before `send` returns.
    Inline,
    /// Hold messages until [`LocalNetwork::pump`] or [`LocalNetwork::step`].
    /// A thread blocked on a remote answer cannot pump for itself, so
    /// analyses of remote writes need a second thread pumping.
    Queued,
}

struct Frame {
    target: AddressSpace,
    bytes: Vec<u8>,
}

pub struct LocalNetwork {
    mode: DeliveryMode,
    spaces: RwLock<FxHashMap<AddressSpace, Weak<Runtime>>>,
    queue: Mutex<VecDeque<Frame>>,
    sent: Mutex<BTreeMap<&'static str, usize>>,
}

impl LocalNetwork {
    pub fn new(mode: DeliveryMode) -> Arc<LocalNetwork> {
        return Arc::new(LocalNetwork {
            mode,
            spaces: RwLock::new(FxHashMap::default()),
            queue: Mutex::new(VecDeque::new()),
            sent: Mutex::new(BTreeMap::new()),
        });
    }

    pub fn mode(&self) -> DeliveryMode {
        return self.mode;
    }

    pub fn attach(&self, runtime: &Arc<Runtime>) {
        self.spaces.write().insert(runtime.space(), Arc::downgrade(runtime));
    }

    /// Messages of the given kind sent so far, by [`Message::name`].
    pub fn sent(&self, name: &str) -> usize {
        return self.sent.lock().get(name).copied().unwrap_or(0);
    }

    pub fn queued(&self) -> usize {
        return self.queue.lock().len();
    }

    /// Deliver queued messages, including those sent while delivering, until
    /// the queue is empty. Returns the number delivered.
    pub fn pump(&self) -> usize {
        let mut delivered = 0;
        loop {
            let Some(frame) = self.queue.lock().pop_front() else {
                return delivered;
            };
            self.deliver(frame);
            delivered += 1;
        }
    }

    /// Deliver at most one queued message.
    pub fn step(&self) -> bool {
        let Some(frame) = self.queue.lock().pop_front() else {
            return false;
        };
        self.deliver(frame);
        return true;
    }

    fn deliver(&self, frame: Frame) {
        if let Err(err) = self.try_deliver(&frame) {
            tracing::error!(target_space = ?frame.target, error = %err, "dropped message");
        }
    }

    fn try_deliver(&self, frame: &Frame) -> Result<()> {
        let (source, message) = wire::decode(&frame.bytes)?;
        let runtime = self
            .spaces
            .read()
            .get(&frame.target)
            .and_then(Weak::upgrade)
            .ok_or(Error::UnknownAddressSpace(frame.target))?;
        return runtime.handle_message(source, message);
    }
}

impl Transport for LocalNetwork {
    fn send(&self, source: AddressSpace, target: AddressSpace, message: Message) {
        *self.sent.lock().entry(message.name()).or_default() += 1;
        let bytes = match wire::encode(source, &message) {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::error!(source_space = ?source, error = %err, "failed to encode message");
                return;
            }
        };
        let frame = Frame { target, bytes };
        match self.mode {
            DeliveryMode::Inline => self.deliver(frame),
            DeliveryMode::Queued => self.queue.lock().push_back(frame),
        }
    }
}
