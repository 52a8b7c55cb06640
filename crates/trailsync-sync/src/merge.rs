//! Folds normalized feeds into one registry in precedence order.

use tracing::{debug, warn};
use trailsync_adapters::NormalizedFeed;
use trailsync_core::{CanonicalRegistry, FeedKind};

/// Later feeds in `order` replace whole records written by earlier ones.
/// Feeds absent from `order` are ignored.
pub fn merge_feeds(order: &[FeedKind], feeds: &[NormalizedFeed]) -> CanonicalRegistry {
    let mut registry = CanonicalRegistry::new();

    for feed in feeds.iter().filter(|f| !order.contains(&f.feed)) {
        warn!(feed = %feed.feed, "feed not in configured order; ignoring");
    }

    for kind in order {
        let mut replaced = 0usize;
        for normalized in feeds.iter().filter(|f| f.feed == *kind) {
            for fragment in &normalized.fragments {
                if registry.insert(fragment.key.clone(), fragment.record.clone()).is_some() {
                    replaced += 1;
                }
            }
        }
        debug!(feed = %kind, replaced, total = registry.len(), "merged feed");
    }

    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use trailsync_adapters::Fragment;
    use trailsync_core::{CanonicalRecord, IdentityKey};

    fn fragment(key: &str, lat: f64, lon: f64) -> Fragment {
        Fragment {
            key: IdentityKey::normalize(key).unwrap(),
            record: CanonicalRecord {
                latitude: Some(lat),
                longitude: Some(lon),
                ..Default::default()
            },
        }
    }

    fn feed(kind: FeedKind, fragments: Vec<Fragment>) -> NormalizedFeed {
        NormalizedFeed {
            feed: kind,
            fragments,
            excluded: 0,
            unkeyed: 0,
        }
    }

    #[test]
    fn last_feed_in_order_wins_even_when_middle_feed_is_silent() {
        let feeds = vec![
            feed(FeedKind::Skybitz, vec![fragment("T1", 10.0, 20.0)]),
            feed(FeedKind::Samsara, vec![fragment("T2", 1.0, 1.0)]),
            feed(FeedKind::Insight, vec![fragment("T1", 11.0, 21.0)]),
        ];

        let registry = merge_feeds(&FeedKind::DEFAULT_ORDER, &feeds);

        let t1 = registry.get(&IdentityKey::normalize("T1").unwrap()).unwrap();
        assert_eq!(t1.latitude, Some(11.0));
        assert_eq!(t1.longitude, Some(21.0));
        let keys: Vec<_> = registry.keys().map(|k| k.as_str()).collect();
        assert_eq!(keys, vec!["T1", "T2"]);
    }

    #[test]
    fn later_feed_erases_fields_it_does_not_carry() {
        let mut rich = fragment("T1", 10.0, 20.0);
        rich.record.idle_duration = Some("4 hours".into());
        let feeds = vec![
            feed(FeedKind::Skybitz, vec![rich]),
            feed(FeedKind::Samsara, vec![fragment("TRL# t1", 12.0, 22.0)]),
        ];

        let registry = merge_feeds(&FeedKind::DEFAULT_ORDER, &feeds);

        let t1 = registry.get(&IdentityKey::normalize("T1").unwrap()).unwrap();
        assert_eq!(t1.idle_duration, None);
        assert_eq!(t1.latitude, Some(12.0));
    }

    #[test]
    fn configured_order_controls_precedence() {
        let feeds = vec![
            feed(FeedKind::Skybitz, vec![fragment("T1", 10.0, 20.0)]),
            feed(FeedKind::Insight, vec![fragment("T1", 11.0, 21.0)]),
        ];

        let registry = merge_feeds(&[FeedKind::Insight, FeedKind::Skybitz], &feeds);

        let t1 = registry.get(&IdentityKey::normalize("T1").unwrap()).unwrap();
        assert_eq!(t1.latitude, Some(10.0));
    }

    #[test]
    fn merging_the_same_snapshots_twice_is_identical() {
        let feeds = vec![
            feed(FeedKind::Skybitz, vec![fragment("A", 1.0, 2.0), fragment("B", 3.0, 4.0)]),
            feed(FeedKind::Samsara, vec![fragment("B", 5.0, 6.0), fragment("C", 7.0, 8.0)]),
        ];

        let first = merge_feeds(&FeedKind::DEFAULT_ORDER, &feeds);
        let second = merge_feeds(&FeedKind::DEFAULT_ORDER, &feeds);

        assert_eq!(first, second);
        assert_eq!(first.len(), 3);
    }
}
