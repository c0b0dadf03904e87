//! Counting of graph operations through the `tracing` library.
//!
//! Search and insertion emit `debug!` events and spans carrying an
//! `event_type` field with an [`Operation`] id. [`OpCountersLayer`] turns
//! these into counters without the graph code knowing about them.

use std::{
    collections::HashMap,
    fmt::Debug,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, PoisonError, RwLock,
    },
};
use tracing::{
    field::{Field, Visit},
    span, Event, Subscriber,
};
use tracing_subscriber::layer::{Context, Layer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    EvaluateSimilarity,
    ExpandNode,
    LayerSearch,
    PruneNeighbors,
}

/// The number of enum variants of `Operation`
pub const NUM_OPS: usize = 4;
pub type OpCounters = [Vec<OpCounter>; NUM_OPS];

impl Operation {
    pub const fn tag(&self) -> &'static str {
        match self {
            Operation::EvaluateSimilarity => "evaluate_similarity",
            Operation::ExpandNode => "expand_node",
            Operation::LayerSearch => "layer_search",
            Operation::PruneNeighbors => "prune_neighbors",
        }
    }

    pub const fn id(&self) -> usize {
        *self as usize
    }
}

#[derive(Default)]
struct OpVisitor {
    // which operation was encountered
    id: Option<usize>,

    // how much to increment the associated counter
    amount: Option<usize>,
}

impl Visit for OpVisitor {
    fn record_u64(&mut self, field: &Field, value: u64) {
        match field.name() {
            "event_type" => {
                self.id = Some(value as usize);
            }
            "increment_amount" => {
                self.amount = Some(value as usize);
            }
            _ => {}
        }
    }

    fn record_debug(&mut self, _field: &Field, _value: &dyn Debug) {}
}

/// `OpCountersLayer` maintains a list of counters for each variant of the
/// `Operation` enum, which are each incremented when an event or span
/// specifying the associated operation id is encountered. Events and spans
/// without an `event_type` field are ignored.
#[derive(Default)]
pub struct OpCountersLayer {
    counters: Arc<OpCounters>,
}

impl OpCountersLayer {
    pub fn builder() -> OpCountersLayerBuilder {
        OpCountersLayerBuilder::default()
    }

    fn count(&self, visitor: &OpVisitor, event: Option<&Event<'_>>) {
        let Some(counters) = visitor.id.and_then(|id| self.counters.get(id)) else {
            return;
        };
        let increment_amount = visitor.amount.unwrap_or(1);
        for counter in counters {
            match (counter, event) {
                (OpCounter::Static { counter: c }, _) => c.increment(increment_amount),
                (OpCounter::Dynamic { counter: c }, Some(event)) => {
                    c.increment(increment_amount, event)
                }
                (OpCounter::Dynamic { .. }, None) => {}
            }
        }
    }
}

impl<S: Subscriber> Layer<S> for OpCountersLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = OpVisitor::default();
        event.record(&mut visitor);
        self.count(&visitor, Some(event));
    }

    fn on_new_span(&self, attrs: &span::Attributes<'_>, _id: &span::Id, _ctx: Context<'_, S>) {
        let mut visitor = OpVisitor::default();
        attrs.record(&mut visitor);
        self.count(&visitor, None);
    }
}

#[derive(Default)]
pub struct OpCountersLayerBuilder {
    counters: OpCounters,
}

impl OpCountersLayerBuilder {
    pub fn register_static(mut self, counter: StaticCounter, operation: Operation) -> Self {
        self.counters[operation.id()].push(OpCounter::Static { counter });
        self
    }

    pub fn register_dynamic<T: DynamicCounter + Send + Sync + 'static>(
        mut self,
        counter: T,
        operation: Operation,
    ) -> Self {
        self.counters[operation.id()].push(OpCounter::Dynamic {
            counter: Box::new(counter),
        });
        self
    }

    pub fn init(self) -> OpCountersLayer {
        OpCountersLayer {
            counters: Arc::new(self.counters),
        }
    }
}

/// Enum representing two types of counters, static counters which count
/// operations unconditionally, and dynamic counters which respond to fields
/// associated with an event in order to increment one or more counters.
pub enum OpCounter {
    Static {
        counter: StaticCounter,
    },
    Dynamic {
        counter: Box<dyn DynamicCounter + Send + Sync>,
    },
}

pub type StaticCounterRef = Arc<AtomicUsize>;

#[derive(Default)]
pub struct StaticCounter {
    counter: StaticCounterRef,
}

impl StaticCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_counter(&self) -> StaticCounterRef {
        self.counter.clone()
    }

    #[inline(always)]
    pub fn increment(&self, increment_amount: usize) {
        self.counter.fetch_add(increment_amount, Ordering::Relaxed);
    }
}

pub trait DynamicCounter {
    /// Access relevant data from current Event dynamically, and increment
    /// counter based on this data.
    fn increment(&self, increment_amount: usize, event: &Event<'_>);
}

pub type KeyedCounterRef<K> = Arc<RwLock<HashMap<K, AtomicUsize>>>;

pub trait KeyVisitor: Visit + Default {
    type Key: Eq + std::hash::Hash;
    fn get_key(&self) -> Option<Self::Key>;
}

/// Dynamic counter which keeps separate counters for different key values
/// derived from event fields. Events without a key are recorded in a
/// separate `missing_keys` counter.
#[derive(Default)]
pub struct KeyedCounter<K: KeyVisitor> {
    counter_map: KeyedCounterRef<K::Key>,
    missing_keys: StaticCounter,
}

impl<K: KeyVisitor> KeyedCounter<K> {
    pub fn new() -> Self {
        Self {
            counter_map: Arc::default(),
            missing_keys: StaticCounter::new(),
        }
    }

    /// Return references to counter map and missing keys counter
    pub fn get_counters(&self) -> (KeyedCounterRef<K::Key>, StaticCounterRef) {
        (self.counter_map.clone(), self.missing_keys.get_counter())
    }
}

impl<K: KeyVisitor> DynamicCounter for KeyedCounter<K> {
    fn increment(&self, increment_amount: usize, event: &Event<'_>) {
        let mut visitor = K::default();
        event.record(&mut visitor);
        let Some(key) = visitor.get_key() else {
            self.missing_keys.increment(increment_amount);
            return;
        };
        {
            let counters_read = self.counter_map.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(counter) = counters_read.get(&key) {
                counter.fetch_add(increment_amount, Ordering::Relaxed);
                return;
            }
        }
        self.counter_map
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key)
            .or_default()
            .fetch_add(increment_amount, Ordering::Relaxed);
    }
}

/// Counts `ExpandNode` events by the layer they occur in.
pub type LayerExpansionsCounter = KeyedCounter<LayerKey>;

#[derive(Default)]
pub struct LayerKey {
    lc: Option<u64>,
}

impl KeyVisitor for LayerKey {
    type Key = u64;

    fn get_key(&self) -> Option<u64> {
        self.lc
    }
}

impl Visit for LayerKey {
    fn record_u64(&mut self, field: &Field, value: u64) {
        if field.name() == "lc" {
            self.lc = Some(value);
        }
    }

    fn record_debug(&mut self, _field: &Field, _value: &dyn Debug) {}
}
