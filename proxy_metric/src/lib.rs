//! A small metric registry rendered in the Prometheus text exposition format
//!
//! Instruments are registered once by name and hand out cheap recorders per attribute set:
//!
//! ```
//! use proxy_metric::{Registry, U64Counter};
//!
//! let registry = Registry::new();
//! let requests = registry.register_metric::<U64Counter>("http_requests", "handled requests");
//! requests.recorder(&[("path", "/write"), ("status", "204")]).inc(1);
//!
//! assert!(registry.render_prometheus().contains(r#"http_requests{path="/write",status="204"} 1"#));
//! ```
use std::{
    any::Any,
    borrow::Cow,
    collections::BTreeMap,
    fmt::{Debug, Write},
    sync::Arc,
};

use parking_lot::Mutex;

mod counter;
mod gauge;

pub use counter::U64Counter;
pub use gauge::U64Gauge;

/// The kind of a metric
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    U64Counter,
    U64Gauge,
}

impl MetricKind {
    fn prometheus_type(&self) -> &'static str {
        match self {
            Self::U64Counter => "counter",
            Self::U64Gauge => "gauge",
        }
    }
}

/// A single observed value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    U64Counter(u64),
    U64Gauge(u64),
}

impl Observation {
    fn value(&self) -> u64 {
        match self {
            Self::U64Counter(v) | Self::U64Gauge(v) => *v,
        }
    }
}

/// The state of a metric for one attribute set
pub trait MetricObserver: Debug + Default + Clone + Send + Sync + 'static {
    type Recorder;

    fn kind() -> MetricKind;

    fn recorder(&self) -> Self::Recorder;

    fn observe(&self) -> Observation;
}

/// A sorted set of key/value attributes identifying one series of a metric
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Attributes(BTreeMap<&'static str, Cow<'static, str>>);

impl Attributes {
    pub fn insert(&mut self, key: &'static str, value: impl Into<Cow<'static, str>>) {
        self.0.insert(key, value.into());
    }

    fn render(&self, out: &mut String) {
        if self.0.is_empty() {
            return;
        }
        out.push('{');
        for (i, (key, value)) in self.0.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            let _ = write!(out, "{key}=\"{}\"", escape_label(value));
        }
        out.push('}');
    }
}

impl<const N: usize> From<&[(&'static str, &'static str); N]> for Attributes {
    fn from(iterator: &[(&'static str, &'static str); N]) -> Self {
        Self(
            iterator
                .iter()
                .map(|(key, value)| (*key, Cow::Borrowed(*value)))
                .collect(),
        )
    }
}

impl<const N: usize> From<[(&'static str, Cow<'static, str>); N]> for Attributes {
    fn from(iterator: [(&'static str, Cow<'static, str>); N]) -> Self {
        Self(iterator.into_iter().collect())
    }
}

fn escape_label(value: &str) -> Cow<'_, str> {
    if !value.contains(['\\', '"', '\n']) {
        return Cow::Borrowed(value);
    }
    Cow::Owned(
        value
            .replace('\\', r"\\")
            .replace('"', "\\\"")
            .replace('\n', r"\n"),
    )
}

/// A named metric with one observer per attribute set
#[derive(Debug)]
pub struct Metric<T: MetricObserver> {
    shared: Arc<MetricShared<T>>,
}

#[derive(Debug)]
struct MetricShared<T: MetricObserver> {
    name: &'static str,
    description: &'static str,
    values: Mutex<BTreeMap<Attributes, T>>,
}

impl<T: MetricObserver> Clone for Metric<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: MetricObserver> Metric<T> {
    fn new(name: &'static str, description: &'static str) -> Self {
        Self {
            shared: Arc::new(MetricShared {
                name,
                description,
                values: Default::default(),
            }),
        }
    }

    /// The recorder for `attributes`, creating its observer on first use
    pub fn recorder(&self, attributes: impl Into<Attributes>) -> T::Recorder {
        self.shared
            .values
            .lock()
            .entry(attributes.into())
            .or_default()
            .recorder()
    }

    /// The observer for `attributes` if anything was recorded for it
    pub fn get_observer(&self, attributes: &Attributes) -> Option<T> {
        self.shared.values.lock().get(attributes).cloned()
    }
}

trait Instrument: Debug + Send + Sync {
    fn render(&self, out: &mut String);

    fn as_any(&self) -> &dyn Any;
}

impl<T: MetricObserver> Instrument for Metric<T> {
    fn render(&self, out: &mut String) {
        let shared = &self.shared;
        let _ = writeln!(out, "# HELP {} {}", shared.name, shared.description);
        let _ = writeln!(out, "# TYPE {} {}", shared.name, T::kind().prometheus_type());
        for (attributes, observer) in shared.values.lock().iter() {
            out.push_str(shared.name);
            attributes.render(out);
            let _ = writeln!(out, " {}", observer.observe().value());
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// The set of registered metrics
#[derive(Debug, Default)]
pub struct Registry {
    instruments: Mutex<BTreeMap<&'static str, Box<dyn Instrument>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a metric, or return the existing one of the same name
    ///
    /// # Panics
    ///
    /// Panics if a metric of the same name but a different type is already registered.
    pub fn register_metric<T: MetricObserver>(
        &self,
        name: &'static str,
        description: &'static str,
    ) -> Metric<T> {
        let mut instruments = self.instruments.lock();
        let instrument = instruments
            .entry(name)
            .or_insert_with(|| Box::new(Metric::<T>::new(name, description)) as Box<dyn Instrument>);
        match instrument.as_any().downcast_ref::<Metric<T>>() {
            Some(metric) => metric.clone(),
            None => panic!("metric {name} registered with a different type"),
        }
    }

    /// The metric registered under `name` if it has type `I`
    pub fn get_instrument<I: Clone + 'static>(&self, name: &'static str) -> Option<I> {
        self.instruments
            .lock()
            .get(name)
            .and_then(|i| i.as_any().downcast_ref::<I>())
            .cloned()
    }

    /// Every metric in the Prometheus text exposition format, ordered by name
    pub fn render_prometheus(&self) -> String {
        let mut out = String::new();
        for instrument in self.instruments.lock().values() {
            instrument.render(&mut out);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_registry() {
        let registry = Registry::new();
        let counter = registry.register_metric::<U64Counter>("foo", "my magic counter");
        let gauge = registry.register_metric::<U64Gauge>("bar", "my magic gauge");

        counter.recorder(&[("tag1", "a")]).inc(3);
        counter.recorder(&[("tag1", "a")]).inc(2);
        counter.recorder(&[("tag1", "b\"")]).inc(1);
        gauge.recorder(Attributes::default()).set(7);

        let again = registry.register_metric::<U64Counter>("foo", "ignored");
        assert_eq!(
            again
                .get_observer(&Attributes::from(&[("tag1", "a")]))
                .unwrap()
                .fetch(),
            5
        );

        let found = registry
            .get_instrument::<Metric<U64Gauge>>("bar")
            .expect("gauge registered");
        assert_eq!(
            found.get_observer(&Attributes::default()).unwrap().observe(),
            Observation::U64Gauge(7)
        );
        assert!(registry.get_instrument::<Metric<U64Counter>>("bar").is_none());

        assert_eq!(
            registry.render_prometheus(),
            "# HELP bar my magic gauge\n\
             # TYPE bar gauge\n\
             bar 7\n\
             # HELP foo my magic counter\n\
             # TYPE foo counter\n\
             foo{tag1=\"a\"} 5\n\
             foo{tag1=\"b\\\"\"} 1\n"
        );
    }

    #[test]
    #[should_panic(expected = "registered with a different type")]
    fn test_type_mismatch() {
        let registry = Registry::new();
        registry.register_metric::<U64Counter>("foo", "counter");
        registry.register_metric::<U64Gauge>("foo", "gauge");
    }
}
