use std::collections::HashMap;

use focus_core::prelude::{CaptureMetadata, MetadataKey, MetadataValue};
use parking_lot::RwLock;

/// One key whose latest value changed.
#[derive(Debug, Clone, PartialEq)]
pub struct MetadataChange {
    pub key: MetadataKey,
    pub old: Option<MetadataValue>,
    pub new: MetadataValue,
}

/// Most recent value per metadata key, monotonic in frame number.
///
/// An update carrying a frame number older than the one recorded for a key
/// is ignored for that key.
///
/// # Example
/// ```rust
/// use focus_capture::prelude::*;
///
/// let table = MetadataTable::default();
/// let newer = CaptureMetadata::new(5, 500).with(MetadataKey::AE_STATE, AeState::Converged);
/// let older = CaptureMetadata::new(4, 400).with(MetadataKey::AE_STATE, AeState::Searching);
/// table.update(&newer);
/// assert!(table.update(&older).is_empty());
/// assert_eq!(table.get(MetadataKey::AE_STATE), Some(AeState::Converged.value()));
/// ```
#[derive(Debug, Default)]
pub struct MetadataTable {
    entries: RwLock<HashMap<MetadataKey, (i64, MetadataValue)>>,
}

impl MetadataTable {
    /// Record every key in `metadata`; returns the keys whose value changed.
    ///
    /// Change is judged by value equality. Metadata values are plain enums
    /// and scalars with no identity, so a repeated value reports no change.
    pub fn update(&self, metadata: &CaptureMetadata) -> Vec<MetadataChange> {
        let frame = metadata.frame_number();
        let mut changes = Vec::new();
        let mut entries = self.entries.write();
        for (key, value) in metadata.iter() {
            let old = match entries.get(&key) {
                Some((recorded, _)) if frame < *recorded => continue,
                Some((_, old)) => Some(old.clone()),
                None => None,
            };
            entries.insert(key, (frame, value.clone()));
            if old.as_ref() != Some(value) {
                changes.push(MetadataChange {
                    key,
                    old,
                    new: value.clone(),
                });
            }
        }
        changes
    }

    pub fn get(&self, key: MetadataKey) -> Option<MetadataValue> {
        self.entries.read().get(&key).map(|(_, value)| value.clone())
    }

    /// Frame number of the recorded value for `key`.
    pub fn frame_of(&self, key: MetadataKey) -> Option<i64> {
        self.entries.read().get(&key).map(|(frame, _)| *frame)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use focus_core::prelude::{AfState, LensState};

    #[test]
    fn unchanged_values_produce_no_change() {
        let table = MetadataTable::default();
        let first = CaptureMetadata::new(1, 10).with(MetadataKey::LENS_STATE, LensState::Moving);
        let second = CaptureMetadata::new(2, 20).with(MetadataKey::LENS_STATE, LensState::Moving);
        let changes = table.update(&first);
        assert_eq!(changes.len(), 2);
        let changes = table.update(&second);
        // Only the timestamp key moved.
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].key, MetadataKey::SENSOR_TIMESTAMP);
        assert_eq!(table.frame_of(MetadataKey::LENS_STATE), Some(2));
    }

    #[test]
    fn change_reports_old_and_new() {
        let table = MetadataTable::default();
        table.update(&CaptureMetadata::new(1, 10).with(MetadataKey::AF_STATE, AfState::PassiveScan));
        let changes =
            table.update(&CaptureMetadata::new(2, 20).with(MetadataKey::AF_STATE, AfState::PassiveFocused));
        let af = changes
            .iter()
            .find(|c| c.key == MetadataKey::AF_STATE)
            .unwrap();
        assert_eq!(af.old, Some(AfState::PassiveScan.value()));
        assert_eq!(af.new, AfState::PassiveFocused.value());
    }

    #[test]
    fn same_frame_update_is_accepted() {
        let table = MetadataTable::default();
        table.update(&CaptureMetadata::new(3, 30).with(MetadataKey::AF_STATE, AfState::PassiveScan));
        let changes =
            table.update(&CaptureMetadata::new(3, 30).with(MetadataKey::AF_STATE, AfState::ActiveScan));
        assert_eq!(changes.len(), 1);
        assert_eq!(table.get(MetadataKey::AF_STATE), Some(AfState::ActiveScan.value()));
    }
}
