//! Tenant-tagged metric registry.
//!
//! Components obtain [`GaugeHandle`]s and [`CounterHandle`]s from a
//! [`MetricsRegistry`] and update them from any thread. Every handle keeps its
//! own atomic value so the owning component can read it back (statistics,
//! tests) regardless of which sink is installed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use flowforge_core::TenantId;

/// Label under which the tenant identity is exported.
pub const TENANT_LABEL: &str = "tenant";

/// Name + tenant label identifying one time series.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MetricKey {
    pub name: &'static str,
    pub tenant_id: TenantId,
}

impl MetricKey {
    pub fn new(name: &'static str, tenant_id: TenantId) -> Self {
        Self { name, tenant_id }
    }
}

impl core::fmt::Display for MetricKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}{{{}={}}}", self.name, TENANT_LABEL, self.tenant_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Gauge,
    Counter,
}

/// Sink of one exported series, shared by every clone of its handle.
///
/// Cleared by the registry on removal; clones stop forwarding from then on.
#[derive(Clone)]
struct Export<T> {
    sink: T,
    live: Arc<AtomicBool>,
}

impl<T> Export<T> {
    fn new(sink: T) -> Self {
        Self {
            sink,
            live: Arc::new(AtomicBool::new(true)),
        }
    }

    fn sink(&self) -> Option<&T> {
        self.live.load(Ordering::SeqCst).then_some(&self.sink)
    }
}

/// Up/down value (e.g. works currently queued).
#[derive(Clone)]
pub struct GaugeHandle {
    value: Arc<AtomicI64>,
    exported: Option<Export<::metrics::Gauge>>,
}

impl GaugeHandle {
    /// A gauge nobody else observes.
    pub fn detached() -> Self {
        Self {
            value: Arc::new(AtomicI64::new(0)),
            exported: None,
        }
    }

    pub fn increment(&self) -> i64 {
        let v = self.value.fetch_add(1, Ordering::SeqCst) + 1;
        self.export(v);
        v
    }

    pub fn decrement(&self) -> i64 {
        let v = self.value.fetch_sub(1, Ordering::SeqCst) - 1;
        self.export(v);
        v
    }

    pub fn set(&self, v: i64) {
        self.value.store(v, Ordering::SeqCst);
        self.export(v);
    }

    pub fn get(&self) -> i64 {
        self.value.load(Ordering::SeqCst)
    }

    /// Whether updates still reach an external sink.
    pub fn is_exported(&self) -> bool {
        self.exported.as_ref().is_some_and(|e| e.sink().is_some())
    }

    fn export(&self, v: i64) {
        if let Some(g) = self.exported.as_ref().and_then(Export::sink) {
            g.set(v as f64);
        }
    }
}

impl core::fmt::Debug for GaugeHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("GaugeHandle")
            .field("value", &self.get())
            .field("exported", &self.is_exported())
            .finish()
    }
}

/// Monotonic counter (e.g. works executed).
#[derive(Clone)]
pub struct CounterHandle {
    value: Arc<AtomicU64>,
    exported: Option<Export<::metrics::Counter>>,
}

impl CounterHandle {
    pub fn detached() -> Self {
        Self {
            value: Arc::new(AtomicU64::new(0)),
            exported: None,
        }
    }

    pub fn increment(&self) -> u64 {
        let v = self.value.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(c) = self.exported.as_ref().and_then(Export::sink) {
            c.increment(1);
        }
        v
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::SeqCst)
    }

    /// Whether increments still reach an external sink.
    pub fn is_exported(&self) -> bool {
        self.exported.as_ref().is_some_and(|e| e.sink().is_some())
    }
}

impl core::fmt::Debug for CounterHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CounterHandle")
            .field("value", &self.get())
            .field("exported", &self.is_exported())
            .finish()
    }
}

/// Registry accepting tenant-tagged gauges and counters.
pub trait MetricsRegistry: Send + Sync + core::fmt::Debug {
    fn gauge(&self, key: MetricKey) -> GaugeHandle;

    fn counter(&self, key: MetricKey) -> CounterHandle;

    /// Unregister a series. Unknown keys are ignored.
    fn remove(&self, key: &MetricKey);
}

pub type SharedMetricsRegistry = Arc<dyn MetricsRegistry>;

#[derive(Debug, Clone)]
enum Registered {
    Gauge(GaugeHandle),
    Counter(CounterHandle),
}

/// In-memory registry for tests/dev.
///
/// Registered series stay readable until removed, which makes unregistration
/// observable.
#[derive(Debug, Default)]
pub struct InMemoryMetricsRegistry {
    series: Mutex<HashMap<MetricKey, Registered>>,
}

impl InMemoryMetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Current value of a registered series.
    pub fn value(&self, key: &MetricKey) -> Option<i64> {
        let series = self.series.lock().unwrap_or_else(|p| p.into_inner());
        series.get(key).map(|s| match s {
            Registered::Gauge(g) => g.get(),
            Registered::Counter(c) => c.get() as i64,
        })
    }

    pub fn kind(&self, key: &MetricKey) -> Option<MetricKind> {
        let series = self.series.lock().unwrap_or_else(|p| p.into_inner());
        series.get(key).map(|s| match s {
            Registered::Gauge(_) => MetricKind::Gauge,
            Registered::Counter(_) => MetricKind::Counter,
        })
    }

    /// All series registered for a tenant.
    pub fn keys_for(&self, tenant_id: TenantId) -> Vec<MetricKey> {
        let series = self.series.lock().unwrap_or_else(|p| p.into_inner());
        let mut keys: Vec<_> = series
            .keys()
            .filter(|k| k.tenant_id == tenant_id)
            .cloned()
            .collect();
        keys.sort_by_key(|k| k.name);
        keys
    }
}

impl MetricsRegistry for InMemoryMetricsRegistry {
    fn gauge(&self, key: MetricKey) -> GaugeHandle {
        let mut series = self.series.lock().unwrap_or_else(|p| p.into_inner());
        match series.get(&key) {
            Some(Registered::Gauge(g)) => g.clone(),
            _ => {
                let g = GaugeHandle::detached();
                series.insert(key, Registered::Gauge(g.clone()));
                g
            }
        }
    }

    fn counter(&self, key: MetricKey) -> CounterHandle {
        let mut series = self.series.lock().unwrap_or_else(|p| p.into_inner());
        match series.get(&key) {
            Some(Registered::Counter(c)) => c.clone(),
            _ => {
                let c = CounterHandle::detached();
                series.insert(key, Registered::Counter(c.clone()));
                c
            }
        }
    }

    fn remove(&self, key: &MetricKey) {
        self.series
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(key);
    }
}

/// Registry forwarding to the process-wide `metrics` recorder.
///
/// The facade cannot unregister a series. Removal detaches every handle of the
/// series from the recorder and zeroes a gauge's last exported value.
#[derive(Debug, Default)]
pub struct FacadeMetricsRegistry {
    series: Mutex<HashMap<MetricKey, Detach>>,
}

struct Detach {
    live: Arc<AtomicBool>,
    gauge: Option<::metrics::Gauge>,
}

impl core::fmt::Debug for Detach {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Detach")
            .field("live", &self.live.load(Ordering::SeqCst))
            .field("gauge", &self.gauge.is_some())
            .finish()
    }
}

impl FacadeMetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn track(&self, key: MetricKey, detach: Detach) {
        let previous = self
            .series
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(key, detach);
        // A series registered again replaces the earlier handles.
        if let Some(previous) = previous {
            previous.live.store(false, Ordering::SeqCst);
        }
    }
}

impl MetricsRegistry for FacadeMetricsRegistry {
    fn gauge(&self, key: MetricKey) -> GaugeHandle {
        let sink = ::metrics::gauge!(key.name, TENANT_LABEL => key.tenant_id.to_string());
        let export = Export::new(sink.clone());
        self.track(
            key,
            Detach {
                live: Arc::clone(&export.live),
                gauge: Some(sink),
            },
        );
        GaugeHandle {
            value: Arc::new(AtomicI64::new(0)),
            exported: Some(export),
        }
    }

    fn counter(&self, key: MetricKey) -> CounterHandle {
        let sink = ::metrics::counter!(key.name, TENANT_LABEL => key.tenant_id.to_string());
        let export = Export::new(sink);
        self.track(
            key,
            Detach {
                live: Arc::clone(&export.live),
                gauge: None,
            },
        );
        CounterHandle {
            value: Arc::new(AtomicU64::new(0)),
            exported: Some(export),
        }
    }

    fn remove(&self, key: &MetricKey) {
        let removed = self
            .series
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(key);
        if let Some(detach) = removed {
            detach.live.store(false, Ordering::SeqCst);
            if let Some(g) = detach.gauge {
                g.set(0.0);
            }
        }
    }
}
