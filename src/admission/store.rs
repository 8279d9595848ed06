use std::collections::HashMap;

use super::{
    AdmissionSettings, Attributes,
    bucket::{Bucket, FairnessKey, LimitState},
};

/// `name -> value -> bucket`. Buckets are created lazily on first reference.
#[derive(Debug, Default)]
pub(crate) struct BucketStore {
    buckets: HashMap<String, HashMap<String, Bucket>>,
}

/// Tally of bucket states after a rotation pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct RotationSummary {
    pub(crate) buckets: usize,
    pub(crate) blocked: usize,
    pub(crate) probing: usize,
    pub(crate) evicted: usize,
}

impl BucketStore {
    /// One key per attribute, in name order.
    pub(crate) fn keys_for(attributes: &Attributes) -> Vec<FairnessKey> {
        attributes
            .iter()
            .map(|(name, value)| FairnessKey::new(name.as_str(), value.as_str()))
            .collect()
    }

    pub(crate) fn bucket_for(&mut self, key: &FairnessKey) -> &mut Bucket {
        let values = self.buckets.entry(key.name.clone()).or_default();
        if !values.contains_key(&key.value) {
            trace!(message = "Creating bucket.", %key);
        }
        values.entry(key.value.clone()).or_default()
    }

    pub(crate) fn get(&self, key: &FairnessKey) -> Option<&Bucket> {
        self.buckets.get(&key.name)?.get(&key.value)
    }

    pub(crate) fn get_mut(&mut self, key: &FairnessKey) -> Option<&mut Bucket> {
        self.buckets.get_mut(&key.name)?.get_mut(&key.value)
    }

    pub(crate) fn len(&self) -> usize {
        self.buckets.values().map(HashMap::len).sum()
    }

    /// Rotates every bucket, calling `on_change` for each limit transition,
    /// then evicts idle buckets when configured to.
    pub(crate) fn rotate_all(
        &mut self,
        settings: &AdmissionSettings,
        mut on_change: impl FnMut(FairnessKey, LimitState, LimitState),
    ) -> RotationSummary {
        let mut summary = RotationSummary::default();

        for (name, values) in self.buckets.iter_mut() {
            for (value, bucket) in values.iter_mut() {
                let from = bucket.state();
                let to = bucket.rotate(settings);
                if from != to {
                    on_change(FairnessKey::new(name.as_str(), value.as_str()), from, to);
                }
                match to {
                    LimitState::Blocked => summary.blocked += 1,
                    LimitState::Probe => summary.probing += 1,
                    LimitState::Unrestricted => {}
                }
            }
        }

        if let Some(max_idle_frames) = settings.max_idle_frames {
            for values in self.buckets.values_mut() {
                let before = values.len();
                values.retain(|_, bucket| !bucket.is_evictable(max_idle_frames));
                summary.evicted += before - values.len();
            }
            self.buckets.retain(|_, values| !values.is_empty());
        }

        summary.buckets = self.len();
        summary
    }
}
