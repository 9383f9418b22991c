use std::{
    collections::BTreeMap,
    sync::{PoisonError, RwLock},
};

use snafu::ensure;

use crate::{
    conversion::{
        BrokenChainSnafu, Conversion, ConversionChain, LoopSnafu, Result, UnknownVersionSnafu,
    },
    settings::Settings,
};

/// A programmatic conversion chain, keyed by source version.
#[derive(Debug)]
pub struct Chain {
    inner: RwLock<ChainInner>,
}

#[derive(Debug)]
struct ChainInner {
    conversions: BTreeMap<u32, Conversion>,
    latest_version: u32,
}

impl Default for Chain {
    fn default() -> Self {
        Self {
            inner: RwLock::new(ChainInner {
                conversions: BTreeMap::new(),
                latest_version: 1,
            }),
        }
    }
}

impl Chain {
    pub fn new(conversions: impl IntoIterator<Item = Conversion>) -> Self {
        let chain = Self::default();
        for conversion in conversions {
            chain.add(conversion);
        }
        chain
    }

    pub fn add(&self, conversion: Conversion) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.latest_version = inner.latest_version.max(conversion.target());
        inner.conversions.insert(conversion.source(), conversion);
    }

    pub fn len(&self) -> usize {
        self.read_conversions(BTreeMap::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read_conversions<T>(&self, f: impl FnOnce(&BTreeMap<u32, Conversion>) -> T) -> T {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        f(&inner.conversions)
    }
}

impl ConversionChain for Chain {
    fn latest_version(&self) -> u32 {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .latest_version
    }

    fn is_known_version(&self, version: u32) -> bool {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        version == inner.latest_version || inner.conversions.contains_key(&version)
    }

    fn previous_versions(&self) -> Vec<u32> {
        self.read_conversions(|conversions| conversions.keys().copied().collect())
    }

    fn convert_to_latest(&self, from_version: u32, settings: &Settings) -> Result<Settings> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        if from_version == inner.latest_version {
            return Ok(settings.clone());
        }

        ensure!(
            inner.conversions.contains_key(&from_version),
            UnknownVersionSnafu {
                version: from_version
            }
        );

        let max_steps = inner.conversions.len();
        let mut current_version = from_version;
        let mut converted = settings.clone();
        let mut steps = 0;

        while current_version != inner.latest_version {
            let Some(conversion) = inner.conversions.get(&current_version) else {
                return BrokenChainSnafu {
                    version: current_version,
                }
                .fail();
            };

            steps += 1;
            ensure!(steps <= max_steps, LoopSnafu { steps });

            converted = conversion.convert(&converted)?;
            current_version = conversion.target();
        }

        Ok(converted)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use serde_json::{Value, json};

    use super::*;
    use crate::conversion::Error;

    fn chain_one_two_three() -> Chain {
        Chain::new([
            Conversion::new(1, 2, |settings| {
                settings.delete_and_clean("paramGroup.obsoleteParam")?;
                Ok(())
            })
            .expect("valid conversion"),
            Conversion::new(2, 3, |settings| {
                if let Some(value) = settings.get("replicas")? {
                    settings.delete("replicas")?;
                    settings.set("scale.replicas", value)?;
                }
                Ok(())
            })
            .expect("valid conversion"),
        ])
    }

    fn settings(value: Value) -> Settings {
        match value {
            Value::Object(map) => Settings::new(map),
            _ => unreachable!("test fixture must be an object"),
        }
    }

    #[test]
    fn empty_chain_has_latest_version_one() {
        let chain = Chain::default();

        assert_eq!(chain.latest_version(), 1);
        assert!(chain.is_known_version(1));
        assert!(!chain.is_known_version(2));
        assert!(chain.previous_versions().is_empty());
    }

    #[test]
    fn latest_version_is_max_target() {
        let chain = chain_one_two_three();

        assert_eq!(chain.latest_version(), 3);
        assert_eq!(chain.previous_versions(), vec![1, 2]);
        assert!(chain.is_known_version(3));
        assert!(!chain.is_known_version(4));
    }

    #[test]
    fn latest_version_is_idempotent() {
        let chain = chain_one_two_three();
        let input = settings(json!({"paramGroup": {"obsoleteParam": "v"}}));

        let converted = chain
            .convert_to_latest(3, &input)
            .expect("latest version needs no conversion");
        assert_eq!(converted, input);
    }

    #[rstest]
    #[case(1, json!({"paramGroup": {"obsoleteParam": "v", "param1": "a"}, "replicas": 2}))]
    #[case(2, json!({"paramGroup": {"param1": "a"}, "replicas": 2}))]
    fn converts_to_latest(#[case] from_version: u32, #[case] input: Value) {
        let chain = chain_one_two_three();

        let converted = chain
            .convert_to_latest(from_version, &settings(input))
            .expect("conversion must succeed");

        assert_eq!(
            Value::Object(converted.map()),
            json!({"paramGroup": {"param1": "a"}, "scale": {"replicas": 2}})
        );
    }

    #[test]
    fn converted_types_are_consistent_across_start_versions() {
        let chain = chain_one_two_three();
        let from_one = chain
            .convert_to_latest(1, &settings(json!({"replicas": 2, "name": "x"})))
            .expect("conversion must succeed");
        let from_two = chain
            .convert_to_latest(2, &settings(json!({"replicas": 3, "name": "y"})))
            .expect("conversion must succeed");

        for key in ["scale.replicas", "name"] {
            let left = from_one.get(key).expect("valid").expect("present");
            let right = from_two.get(key).expect("valid").expect("present");
            assert_eq!(
                std::mem::discriminant(&left),
                std::mem::discriminant(&right),
                "{key} changed its type"
            );
        }
    }

    #[test]
    fn unknown_version() {
        let chain = chain_one_two_three();
        let error = chain
            .convert_to_latest(99, &Settings::default())
            .expect_err("version 99 is unknown");

        assert!(matches!(error, Error::UnknownVersion { version: 99 }));
    }

    #[test]
    fn broken_chain() {
        let chain = Chain::new([
            Conversion::new(1, 2, |_| Ok(())).expect("valid conversion"),
            Conversion::new(3, 4, |_| Ok(())).expect("valid conversion"),
        ]);
        let error = chain
            .convert_to_latest(1, &Settings::default())
            .expect_err("version 2 has no conversion");

        assert!(matches!(error, Error::BrokenChain { version: 2 }));
    }

    #[test]
    fn failing_step_is_propagated_with_its_version() {
        let chain = Chain::new([
            Conversion::new(1, 2, |_| Ok(())).expect("valid conversion"),
            Conversion::new(2, 3, |_| Err("cannot convert".into())).expect("valid conversion"),
        ]);
        let error = chain
            .convert_to_latest(1, &Settings::default())
            .expect_err("second step fails");

        assert!(matches!(error, Error::Propagated { version: 2, .. }));
    }
}
