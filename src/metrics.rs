use dashmap::DashMap;
use prometheus::{Encoder, Gauge, Registry, TextEncoder};
use std::sync::Arc;
use tracing::warn;

/// Destination for engine gauges keyed by dotted path segments.
pub trait MetricSink: Send + Sync {
    fn set_gauge(&self, key: &[&str], value: f64);
}

/// Gauges registered lazily in a Prometheus registry.
///
/// `["secrets", "pki", "<uuid>", "total_certificates_stored"]` becomes
/// `secrets_pki_<uuid>_total_certificates_stored` with non-alphanumerics
/// replaced by `_`.
pub struct PrometheusSink {
    registry: Registry,
    gauges: DashMap<String, Gauge>,
}

impl PrometheusSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            registry: Registry::new(),
            gauges: DashMap::new(),
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Current value of a gauge, if it has been set.
    pub fn gauge_value(&self, key: &[&str]) -> Option<f64> {
        self.gauges.get(&metric_name(key)).map(|g| g.get())
    }

    /// Text exposition of everything in the registry.
    pub fn render(&self) -> String {
        let mut buffer = Vec::new();
        if let Err(e) = TextEncoder::new().encode(&self.registry.gather(), &mut buffer) {
            warn!("Failed to encode metrics: {}", e);
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl MetricSink for PrometheusSink {
    fn set_gauge(&self, key: &[&str], value: f64) {
        let name = metric_name(key);
        if let Some(gauge) = self.gauges.get(&name) {
            gauge.set(value);
            return;
        }

        let gauge = match Gauge::new(name.clone(), key.join(".")) {
            Ok(gauge) => gauge,
            Err(e) => {
                warn!("Invalid gauge {}: {}", name, e);
                return;
            }
        };
        let gauge = self
            .gauges
            .entry(name.clone())
            .or_insert_with(|| {
                if let Err(e) = self.registry.register(Box::new(gauge.clone())) {
                    warn!("Failed to register gauge {}: {}", name, e);
                }
                gauge
            })
            .clone();
        gauge.set(value);
    }
}

/// Discards everything.
pub struct NoopSink;

impl MetricSink for NoopSink {
    fn set_gauge(&self, _key: &[&str], _value: f64) {}
}

fn metric_name(key: &[&str]) -> String {
    let joined = key.join("_");
    let mut name: String = joined
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    if name.chars().next().map(|c| c.is_ascii_digit()).unwrap_or(true) {
        name.insert(0, '_');
    }
    name
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gauge_registration_and_update() {
        let sink = PrometheusSink::new();
        let key = ["secrets", "pki", "2f1c-9a", "total_certificates_stored"];
        sink.set_gauge(&key, 3.0);
        sink.set_gauge(&key, 4.0);

        assert_eq!(sink.gauge_value(&key), Some(4.0));
        let text = sink.render();
        assert!(text.contains("secrets_pki_2f1c_9a_total_certificates_stored 4"));
    }

    #[test]
    fn test_metric_name_sanitizing() {
        assert_eq!(metric_name(&["a.b", "c-d"]), "a_b_c_d");
        assert_eq!(metric_name(&["9lives"]), "_9lives");
    }
}
