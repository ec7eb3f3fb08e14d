//! Target selection strategies.
//!
//! A [`Selector`] maps a call to a server key from the live server set.
//! Keys have the form `<network>@<address>` (bare addresses default to
//! `tcp`); the value side of a server pair is a query-string of advertised
//! metadata (`weight=4&latitude=52.5&longitude=13.4`).
//!
//! Server lists are kept sorted so that, for a fixed snapshot, round-robin
//! and consistent-hash selection are deterministic regardless of snapshot
//! ordering.

use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;

/// Selection strategy identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SelectMode {
    /// Uniformly random.
    #[default]
    Random,
    /// Rotating index.
    RoundRobin,
    /// Nginx-style smooth weighted round-robin, weights from metadata.
    WeightedRoundRobin,
    /// Weighted by observed probe latency.
    WeightedIcmp,
    /// Jump consistent hash over `(path, method, args)`.
    ConsistentHash,
    /// Nearest server by great-circle distance.
    Closest,
}

/// Picks a target for each call and absorbs server-set updates.
///
/// Implementations use interior mutability: `select` may rotate internal
/// state, and `update_server` replaces the candidate set whenever
/// discovery pushes a new snapshot.
pub trait Selector: Send + Sync {
    /// Returns the key of the chosen server, or `None` when the set is
    /// empty.
    fn select(&self, service_path: &str, service_method: &str, args: &str) -> Option<String>;

    /// Replaces the candidate set with a new snapshot of
    /// `key -> metadata` pairs.
    fn update_server(&self, servers: &HashMap<String, String>);
}

/// Builds the selector for `mode`, seeded with `servers`.
///
/// [`SelectMode::Closest`] starts at the origin; callers configure real
/// coordinates through
/// [`XClient::config_geo_selector`](super::XClient::config_geo_selector).
#[must_use]
pub fn new_selector(mode: SelectMode, servers: &HashMap<String, String>) -> Box<dyn Selector> {
    let selector: Box<dyn Selector> = match mode {
        SelectMode::Random => Box::new(RandomSelector::default()),
        SelectMode::RoundRobin => Box::new(RoundRobinSelector::default()),
        SelectMode::WeightedRoundRobin => Box::new(WeightedRoundRobinSelector::default()),
        SelectMode::WeightedIcmp => Box::new(WeightedIcmpSelector::default()),
        SelectMode::ConsistentHash => Box::new(ConsistentHashSelector::default()),
        SelectMode::Closest => Box::new(GeoSelector::new(0.0, 0.0)),
    };
    selector.update_server(servers);
    selector
}

fn sorted_keys(servers: &HashMap<String, String>) -> Vec<String> {
    let mut keys: Vec<String> = servers.keys().cloned().collect();
    keys.sort();
    keys
}

/// Returns the value of `key` in a `k=v&k2=v2` metadata string.
fn query_value<'a>(metadata: &'a str, key: &str) -> Option<&'a str> {
    metadata.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        (k == key).then_some(v)
    })
}

/// Uniformly random selection.
#[derive(Default)]
pub struct RandomSelector {
    servers: Mutex<Vec<String>>,
}

impl Selector for RandomSelector {
    fn select(&self, _path: &str, _method: &str, _args: &str) -> Option<String> {
        let servers = self.servers.lock();
        if servers.is_empty() {
            return None;
        }
        let i = rand::rng().random_range(0..servers.len());
        Some(servers[i].clone())
    }

    fn update_server(&self, servers: &HashMap<String, String>) {
        *self.servers.lock() = sorted_keys(servers);
    }
}

/// Deterministic rotating selection.
#[derive(Default)]
pub struct RoundRobinSelector {
    state: Mutex<(Vec<String>, usize)>,
}

impl Selector for RoundRobinSelector {
    fn select(&self, _path: &str, _method: &str, _args: &str) -> Option<String> {
        let mut state = self.state.lock();
        let (servers, index) = &mut *state;
        if servers.is_empty() {
            return None;
        }
        let i = *index % servers.len();
        *index = i + 1;
        Some(servers[i].clone())
    }

    fn update_server(&self, servers: &HashMap<String, String>) {
        let mut state = self.state.lock();
        state.0 = sorted_keys(servers);
        state.1 = 0;
    }
}

struct Weighted {
    server: String,
    weight: i64,
    current_weight: i64,
    effective_weight: i64,
}

/// One smooth-weighted-round-robin step over `servers`.
///
/// Every entry gains its effective weight; the entry with the highest
/// current weight wins and pays the total back, which interleaves picks
/// as evenly as the weights allow. Effective weights regrow toward the
/// static weight after having been decayed.
fn next_weighted(servers: &mut [Weighted]) -> Option<usize> {
    let mut total = 0;
    let mut best: Option<usize> = None;

    for i in 0..servers.len() {
        let w = &mut servers[i];
        w.current_weight += w.effective_weight;
        total += w.effective_weight;
        if w.effective_weight < w.weight {
            w.effective_weight += 1;
        }

        match best {
            Some(b) if servers[b].current_weight >= servers[i].current_weight => {}
            _ => best = Some(i),
        }
    }

    let best = best?;
    servers[best].current_weight -= total;
    Some(best)
}

/// Smooth weighted round-robin; weights parsed from the `weight` query
/// parameter of each server's metadata (default 1).
#[derive(Default)]
pub struct WeightedRoundRobinSelector {
    servers: Mutex<Vec<Weighted>>,
}

impl Selector for WeightedRoundRobinSelector {
    fn select(&self, _path: &str, _method: &str, _args: &str) -> Option<String> {
        let mut servers = self.servers.lock();
        let best = next_weighted(&mut servers)?;
        Some(servers[best].server.clone())
    }

    fn update_server(&self, servers: &HashMap<String, String>) {
        let mut weighted: Vec<Weighted> = servers
            .iter()
            .map(|(server, metadata)| {
                let weight = query_value(metadata, "weight")
                    .and_then(|w| w.parse::<i64>().ok())
                    .filter(|w| *w > 0)
                    .unwrap_or(1);
                Weighted {
                    server: server.clone(),
                    weight,
                    current_weight: 0,
                    effective_weight: weight,
                }
            })
            .collect();
        weighted.sort_by(|a, b| a.server.cmp(&b.server));
        *self.servers.lock() = weighted;
    }
}

/// Latency-weighted selection.
///
/// The probe loop itself is left to integrators: feed round-trip times in
/// through [`update_latency`](WeightedIcmpSelector::update_latency) and
/// selection follows the same smooth-weighted rotation, favouring
/// low-latency targets. Targets under 10 ms share the top weight; beyond
/// 200 ms everything degrades to weight 1.
#[derive(Default)]
pub struct WeightedIcmpSelector {
    servers: Mutex<Vec<Weighted>>,
    latencies: Mutex<HashMap<String, u64>>,
}

impl WeightedIcmpSelector {
    /// Records a probe result for `server` and recomputes its weight.
    pub fn update_latency(&self, server: &str, rtt: std::time::Duration) {
        let rtt_ms = rtt.as_millis().min(u128::from(u64::MAX)) as u64;
        self.latencies
            .lock()
            .insert(server.to_string(), rtt_ms);

        let mut servers = self.servers.lock();
        if let Some(w) = servers.iter_mut().find(|w| w.server == server) {
            let weight = weight_for_latency(rtt_ms);
            w.weight = weight;
            w.effective_weight = weight;
        }
    }
}

fn weight_for_latency(rtt_ms: u64) -> i64 {
    match rtt_ms {
        0..=9 => 191,
        10..=199 => 201 - rtt_ms as i64,
        _ => 1,
    }
}

impl Selector for WeightedIcmpSelector {
    fn select(&self, _path: &str, _method: &str, _args: &str) -> Option<String> {
        let mut servers = self.servers.lock();
        let best = next_weighted(&mut servers)?;
        Some(servers[best].server.clone())
    }

    fn update_server(&self, servers: &HashMap<String, String>) {
        let latencies = self.latencies.lock().clone();
        let mut weighted: Vec<Weighted> = servers
            .keys()
            .map(|server| {
                let weight = latencies
                    .get(server)
                    .copied()
                    .map_or(1, weight_for_latency);
                Weighted {
                    server: server.clone(),
                    weight,
                    current_weight: 0,
                    effective_weight: weight,
                }
            })
            .collect();
        weighted.sort_by(|a, b| a.server.cmp(&b.server));
        *self.servers.lock() = weighted;
    }
}

/// Jump-consistent-hash selection keyed by `(path, method, args)`.
#[derive(Default)]
pub struct ConsistentHashSelector {
    servers: Mutex<Vec<String>>,
}

impl Selector for ConsistentHashSelector {
    fn select(&self, path: &str, method: &str, args: &str) -> Option<String> {
        let servers = self.servers.lock();
        if servers.is_empty() {
            return None;
        }
        let key = fnv1a(format!("/{path}/{method}/{args}").as_bytes());
        let bucket = jump_hash(key, servers.len() as i32);
        Some(servers[bucket as usize].clone())
    }

    fn update_server(&self, servers: &HashMap<String, String>) {
        *self.servers.lock() = sorted_keys(servers);
    }
}

/// FNV-1a 64-bit hash.
fn fnv1a(data: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in data {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

/// Lamping-Veach jump consistent hash: maps `key` to a bucket in
/// `[0, buckets)` with minimal reshuffling when the bucket count changes.
fn jump_hash(mut key: u64, buckets: i32) -> i32 {
    let buckets = i64::from(buckets.max(1));
    let mut b: i64 = -1;
    let mut j: i64 = 0;

    while j < buckets {
        b = j;
        key = key.wrapping_mul(2_862_933_555_777_941_757).wrapping_add(1);
        j = ((b.wrapping_add(1) as f64) * ((1u64 << 31) as f64 / ((key >> 33) + 1) as f64)) as i64;
    }

    b as i32
}

struct GeoServer {
    server: String,
    latitude: f64,
    longitude: f64,
}

/// Nearest-server selection by Haversine great-circle distance.
///
/// Servers advertise `latitude` and `longitude` in their metadata; ties
/// are broken uniformly at random.
pub struct GeoSelector {
    latitude: f64,
    longitude: f64,
    servers: Mutex<Vec<GeoServer>>,
}

impl GeoSelector {
    /// Creates a selector anchored at the client's coordinates.
    #[must_use]
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
            servers: Mutex::new(Vec::new()),
        }
    }
}

impl Selector for GeoSelector {
    fn select(&self, _path: &str, _method: &str, _args: &str) -> Option<String> {
        let servers = self.servers.lock();
        if servers.is_empty() {
            return None;
        }

        let mut nearest: Vec<&GeoServer> = Vec::new();
        let mut min = f64::MAX;
        for server in servers.iter() {
            let d = haversine(self.latitude, self.longitude, server.latitude, server.longitude);
            if d < min {
                nearest = vec![server];
                min = d;
            } else if d == min {
                nearest.push(server);
            }
        }

        let i = if nearest.len() == 1 {
            0
        } else {
            rand::rng().random_range(0..nearest.len())
        };
        Some(nearest[i].server.clone())
    }

    fn update_server(&self, servers: &HashMap<String, String>) {
        let mut geo: Vec<GeoServer> = servers
            .iter()
            .filter_map(|(server, metadata)| {
                let latitude = query_value(metadata, "latitude")?.parse().ok()?;
                let longitude = query_value(metadata, "longitude")?.parse().ok()?;
                Some(GeoServer {
                    server: server.clone(),
                    latitude,
                    longitude,
                })
            })
            .collect();
        geo.sort_by(|a, b| a.server.cmp(&b.server));
        *self.servers.lock() = geo;
    }
}

/// Great-circle distance in meters.
fn haversine(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    const EARTH_RADIUS_M: f64 = 6_378_100.0;

    let la1 = lat1.to_radians();
    let lo1 = lon1.to_radians();
    let la2 = lat2.to_radians();
    let lo2 = lon2.to_radians();

    let h = hsin(la2 - la1) + la1.cos() * la2.cos() * hsin(lo2 - lo1);
    2.0 * EARTH_RADIUS_M * h.sqrt().asin()
}

fn hsin(theta: f64) -> f64 {
    (theta / 2.0).sin().powi(2)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn test_round_robin_is_deterministic() {
        let servers = snapshot(&[("tcp@b", ""), ("tcp@a", ""), ("tcp@c", "")]);
        let selector = new_selector(SelectMode::RoundRobin, &servers);

        let picks: Vec<String> = (0..6)
            .map(|_| selector.select("S", "M", "").unwrap())
            .collect();
        assert_eq!(picks, ["tcp@a", "tcp@b", "tcp@c", "tcp@a", "tcp@b", "tcp@c"]);
    }

    #[test]
    fn test_random_only_returns_known_servers() {
        let servers = snapshot(&[("tcp@a", ""), ("tcp@b", "")]);
        let selector = new_selector(SelectMode::Random, &servers);

        for _ in 0..50 {
            let pick = selector.select("S", "M", "").unwrap();
            assert!(servers.contains_key(&pick));
        }
    }

    #[test]
    fn test_empty_set_selects_nothing() {
        let selector = new_selector(SelectMode::Random, &HashMap::new());
        assert!(selector.select("S", "M", "").is_none());
    }

    #[test]
    fn test_smooth_weighted_frequencies_match_weights() {
        let servers = snapshot(&[
            ("tcp@a", "weight=1"),
            ("tcp@b", "weight=2"),
            ("tcp@c", "weight=3"),
        ]);
        let selector = new_selector(SelectMode::WeightedRoundRobin, &servers);

        let mut counts: HashMap<String, usize> = HashMap::new();
        for _ in 0..600 {
            *counts.entry(selector.select("S", "M", "").unwrap()).or_default() += 1;
        }

        assert_eq!(counts["tcp@a"], 100);
        assert_eq!(counts["tcp@b"], 200);
        assert_eq!(counts["tcp@c"], 300);
    }

    #[test]
    fn test_smooth_weighted_interleaves() {
        // The classic 5/1/1 sequence: a a b a c a a.
        let servers = snapshot(&[
            ("a", "weight=5"),
            ("b", "weight=1"),
            ("c", "weight=1"),
        ]);
        let selector = new_selector(SelectMode::WeightedRoundRobin, &servers);

        let picks: Vec<String> = (0..7)
            .map(|_| selector.select("S", "M", "").unwrap())
            .collect();
        assert_eq!(picks, ["a", "a", "b", "a", "c", "a", "a"]);
    }

    #[test]
    fn test_jump_hash_stays_in_range_and_is_deterministic() {
        for buckets in 1..=32 {
            for key in 0..200u64 {
                let bucket = jump_hash(key, buckets);
                assert!(bucket >= 0 && bucket < buckets);
                assert_eq!(bucket, jump_hash(key, buckets));
            }
        }
    }

    #[test]
    fn test_jump_hash_moves_few_keys_on_resize() {
        let mut moved = 0;
        let keys = 1000u64;
        for key in 0..keys {
            if jump_hash(key, 10) != jump_hash(key, 11) {
                moved += 1;
            }
        }
        // Roughly 1/11 of keys should move; allow generous slack.
        assert!(moved < (keys / 5) as i32, "{moved} keys moved");
    }

    #[test]
    fn test_consistent_hash_is_stable_per_call_shape() {
        let servers = snapshot(&[("tcp@a", ""), ("tcp@b", ""), ("tcp@c", "")]);
        let selector = new_selector(SelectMode::ConsistentHash, &servers);

        let first = selector.select("Arith", "Mul", "{10,20}").unwrap();
        for _ in 0..20 {
            assert_eq!(selector.select("Arith", "Mul", "{10,20}").unwrap(), first);
        }
    }

    #[test]
    fn test_geo_selects_nearest() {
        let servers = snapshot(&[
            ("tcp@berlin", "latitude=52.52&longitude=13.40"),
            ("tcp@sydney", "latitude=-33.87&longitude=151.21"),
            ("tcp@no-coords", "weight=3"),
        ]);
        let selector = GeoSelector::new(48.86, 2.35); // Paris
        selector.update_server(&servers);

        assert_eq!(selector.select("S", "M", "").unwrap(), "tcp@berlin");
    }

    #[test]
    fn test_icmp_weights_follow_latency() {
        let servers = snapshot(&[("tcp@fast", ""), ("tcp@slow", "")]);
        let selector = WeightedIcmpSelector::default();
        selector.update_server(&servers);
        selector.update_latency("tcp@fast", std::time::Duration::from_millis(5));
        selector.update_latency("tcp@slow", std::time::Duration::from_millis(150));

        let mut counts: HashMap<String, usize> = HashMap::new();
        for _ in 0..242 {
            *counts.entry(selector.select("S", "M", "").unwrap()).or_default() += 1;
        }
        assert!(counts["tcp@fast"] > counts["tcp@slow"]);
    }

    #[test]
    fn test_update_server_replaces_the_set() {
        let selector = new_selector(SelectMode::RoundRobin, &snapshot(&[("tcp@old", "")]));
        assert_eq!(selector.select("S", "M", "").unwrap(), "tcp@old");

        selector.update_server(&snapshot(&[("tcp@new", "")]));
        assert_eq!(selector.select("S", "M", "").unwrap(), "tcp@new");
    }
}
