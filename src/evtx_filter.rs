use std::ops::RangeInclusive;
use std::str::FromStr;

use crate::chunk::SerializedRecord;

/// A set of inclusive record-id ranges, parsed from forms like
/// `"1-100,205,1000-2000"`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Ranges(Vec<RangeInclusive<u64>>);

impl Ranges {
    pub fn contains(&self, id: u64) -> bool {
        self.0.iter().any(|range| range.contains(&id))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromStr for Ranges {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let mut ranges = Vec::new();

        for part in input.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            match part.split_once('-') {
                Some((start, end)) => {
                    let start: u64 = start
                        .trim()
                        .parse()
                        .map_err(|_| format!("invalid range start in `{part}`"))?;
                    let end: u64 = end
                        .trim()
                        .parse()
                        .map_err(|_| format!("invalid range end in `{part}`"))?;
                    if start > end {
                        return Err(format!("descending range `{part}`"));
                    }
                    ranges.push(start..=end);
                }
                None => {
                    let id: u64 = part
                        .parse()
                        .map_err(|_| format!("invalid record id `{part}`"))?;
                    ranges.push(id..=id);
                }
            }
        }

        if ranges.is_empty() {
            return Err("no ranges given".to_string());
        }
        Ok(Ranges(ranges))
    }
}

/// Record-level output filter.
///
/// An empty filter matches every record, so hosts can thread one through
/// unconditionally.
#[derive(Debug, Clone, Default)]
pub struct EvtxFilter {
    ranges: Option<Ranges>,
}

impl EvtxFilter {
    pub fn empty() -> Self {
        EvtxFilter::default()
    }

    pub fn with_ranges(ranges: Ranges) -> Self {
        EvtxFilter {
            ranges: Some(ranges),
        }
    }

    pub fn matches(&self, record: &SerializedRecord) -> bool {
        match &self.ranges {
            None => true,
            Some(ranges) => ranges.contains(record.event_record_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::RecordData;
    use jiff::Timestamp;

    fn record(id: u64) -> SerializedRecord {
        SerializedRecord {
            event_record_id: id,
            timestamp: Timestamp::UNIX_EPOCH,
            data: RecordData::Xml(String::new()),
        }
    }

    #[test]
    fn test_parses_mixed_ranges() {
        let ranges: Ranges = "1-3, 7,10-12".parse().unwrap();
        for id in [1, 2, 3, 7, 10, 11, 12] {
            assert!(ranges.contains(id), "{id} should match");
        }
        for id in [0, 4, 6, 8, 13] {
            assert!(!ranges.contains(id), "{id} should not match");
        }
    }

    #[test]
    fn test_rejects_malformed_input() {
        assert!("".parse::<Ranges>().is_err());
        assert!("a-b".parse::<Ranges>().is_err());
        assert!("9-1".parse::<Ranges>().is_err());
    }

    #[test]
    fn test_empty_filter_matches_everything() {
        let filter = EvtxFilter::empty();
        assert!(filter.matches(&record(1)));
        assert!(filter.matches(&record(u64::MAX)));
    }

    #[test]
    fn test_range_filter() {
        let filter = EvtxFilter::with_ranges("5-6".parse().unwrap());
        assert!(!filter.matches(&record(4)));
        assert!(filter.matches(&record(5)));
        assert!(filter.matches(&record(6)));
        assert!(!filter.matches(&record(7)));
    }
}
