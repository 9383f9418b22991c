use prometheus::{GaugeVec, Opts, Registry, TextEncoder};

use crate::names::is_global;

pub const OBSOLETE_VERSION_METRIC: &str = "module_config_obsolete_version";

/// Gauge set to 1 for every ModuleConfig whose `spec.version` has a newer
/// schema version available.
#[derive(Clone, Debug)]
pub struct ObsoleteVersionMetric {
    gauge: GaugeVec,
}

impl ObsoleteVersionMetric {
    pub fn new() -> prometheus::Result<Self> {
        let gauge = GaugeVec::new(
            Opts::new(
                OBSOLETE_VERSION_METRIC,
                "ModuleConfig settings use an obsolete schema version",
            ),
            &["name", "version", "latest"],
        )?;
        Ok(Self { gauge })
    }

    pub fn register(&self, registry: &Registry) -> prometheus::Result<()> {
        registry.register(Box::new(self.gauge.clone()))
    }

    /// Drops all series, called before every full refresh.
    pub fn reset(&self) {
        self.gauge.reset();
    }

    /// Sets the series of `name` when `version` is set and below `latest`.
    /// `global` never reports.
    pub fn observe(&self, name: &str, version: u32, latest: u32) {
        if is_global(name) || version == 0 || version >= latest {
            return;
        }

        self.gauge
            .with_label_values(&[name, &version.to_string(), &latest.to_string()])
            .set(1.0);
    }
}

/// Renders all metrics of `registry` in the Prometheus text format.
pub fn encode(registry: &Registry) -> prometheus::Result<String> {
    TextEncoder::new().encode_to_string(&registry.gather())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn series(registry: &Registry) -> Vec<String> {
        encode(registry)
            .expect("metrics encode")
            .lines()
            .filter(|line| line.starts_with(OBSOLETE_VERSION_METRIC))
            .map(str::to_owned)
            .collect()
    }

    #[test]
    fn only_obsolete_versions_are_reported() {
        let registry = Registry::new();
        let metric = ObsoleteVersionMetric::new().expect("valid metric");
        metric.register(&registry).expect("first registration succeeds");

        metric.observe("module-one", 1, 2);
        metric.observe("module-two", 2, 2);
        metric.observe("module-three", 0, 2);
        metric.observe("global", 1, 2);

        let series = series(&registry);
        assert_eq!(series.len(), 1);
        assert!(series[0].contains(r#"name="module-one""#));
        assert!(series[0].contains(r#"version="1""#));
        assert!(series[0].contains(r#"latest="2""#));
        assert!(series[0].ends_with(" 1"));
    }

    #[test]
    fn reset_drops_all_series() {
        let registry = Registry::new();
        let metric = ObsoleteVersionMetric::new().expect("valid metric");
        metric.register(&registry).expect("first registration succeeds");

        metric.observe("module-one", 1, 3);
        metric.observe("module-two", 2, 3);
        assert_eq!(series(&registry).len(), 2);

        metric.reset();
        assert!(series(&registry).is_empty());
    }
}
