use std::sync::Arc;

use volley::bot::{DispatcherSettings, Outcome};
use volley::bot::format::parse_reply;
use volley::geo::{
    haversine_km, DistanceQuery, DistanceResolver, GeoPoint, MemoryLocationTable, ResolveMethod,
    SqliteLocationTable,
};

mod common;
use common::{channel, direct, dispatcher, location_table, resolver, RecordingSink, HOME};

#[test]
fn identical_points_are_zero_km() {
    for p in [HOME, GeoPoint::new(-33.86, 151.21), GeoPoint::new(64.1, -21.9)] {
        assert_eq!(haversine_km(p, p), Some(0.0));
    }
}

#[test]
fn zipcode_resolves_with_place() {
    let res = resolver().resolve(DistanceQuery::Zipcode("22765"));
    assert_eq!(res.method, ResolveMethod::Zipcode);
    assert_eq!(res.place.as_deref(), Some("Hamburg"));
    let km = res.distance_km.unwrap();
    assert!(km < 2.0, "got {km}");
}

#[test]
fn prefix_goes_through_representative_code() {
    let res = resolver().resolve(DistanceQuery::PhonePrefix("030"));
    assert_eq!(res.method, ResolveMethod::PhonePrefix);
    assert_eq!(res.place.as_deref(), Some("Berlin"));
    let km = res.distance_km.unwrap();
    assert!((km - 255.0).abs() < 10.0, "got {km}");
}

#[test]
fn misses_and_null_island_are_unresolved() {
    let r = resolver();
    assert_eq!(r.resolve(DistanceQuery::Zipcode("99999")).method, ResolveMethod::None);
    assert_eq!(r.resolve(DistanceQuery::PhonePrefix("0999")).method, ResolveMethod::None);
    let gps = r.resolve(DistanceQuery::Gps(GeoPoint::new(0.0, 0.0)));
    assert_eq!(gps.method, ResolveMethod::None);
    assert!(gps.distance_km.is_none());

    let empty = DistanceResolver::new(Some(HOME), Arc::new(MemoryLocationTable::new()));
    assert!(!empty.resolve(DistanceQuery::Zipcode("22765")).is_resolved());
}

#[test]
fn gps_uses_home() {
    let res = resolver().resolve(DistanceQuery::Gps(GeoPoint::new(53.8655, 10.6866)));
    assert_eq!(res.method, ResolveMethod::Gps);
    assert!(res.place.is_none());
    let km = res.distance_km.unwrap();
    assert!((km - 60.0).abs() < 5.0, "Hamburg-Lübeck got {km}");
}

#[tokio::test]
async fn zipcode_reply_carries_distance_and_counts_max() {
    let (mut d, _clock) = dispatcher(DispatcherSettings::default());
    let sink = RecordingSink::default();
    let out = d.handle_message(&direct("a1b2c3d4e5f6", "22765"), &sink).await;
    let Outcome::Replied(line) = out else {
        panic!("expected reply, got {out:?}");
    };
    let parsed = parse_reply(&line).expect("reply grammar");
    let km = parsed.distance_km.expect("dist field");
    assert!(km > 0.0 && km < 2.0);

    let stats = d.stats();
    assert_eq!(stats.pings_received, 1);
    assert_eq!(stats.pongs_sent, 1);
    assert!(stats.max_distance_km > 0.0);
    assert_eq!(stats.max_distance_label.as_deref(), Some("Hamburg"));
}

#[tokio::test]
async fn channel_zipcode_reply_mentions_sender_and_distance() {
    let (mut d, _clock) = dispatcher(DispatcherSettings::default());
    let sink = RecordingSink::default();
    let Outcome::Replied(line) = d.handle_message(&channel("Alice", "22765", 1), &sink).await
    else {
        panic!("expected reply");
    };
    let parsed = parse_reply(&line).expect("reply grammar");
    assert_eq!(parsed.sender.as_deref(), Some("Alice"));
    assert_eq!(parsed.route, vec!["a1", "7f"]);
    assert!(parsed.distance_km.unwrap() > 0.0);
}

#[tokio::test]
async fn unknown_zipcode_still_replies_without_distance() {
    let (mut d, _clock) = dispatcher(DispatcherSettings::default());
    let sink = RecordingSink::default();
    let out = d.handle_message(&direct("a1b2c3d4e5f6", "99999"), &sink).await;
    let Outcome::Replied(line) = out else {
        panic!("expected reply, got {out:?}");
    };
    assert!(!line.contains("dist:"), "{line}");
    assert_eq!(d.stats().pongs_sent, 1);
    assert_eq!(d.stats().max_distance_km, 0.0);
}

#[tokio::test]
async fn direct_ping_uses_sender_position() {
    let (mut d, _clock) = dispatcher(DispatcherSettings::default());
    let sink = RecordingSink::default();
    let mut msg = direct("a1b2c3d4e5f6", "ping");
    msg.sender_name = Some("Lübeck-Node".into());
    msg.origin = Some(GeoPoint::new(53.8655, 10.6866));
    let Outcome::Replied(line) = d.handle_message(&msg, &sink).await else {
        panic!("expected reply");
    };
    assert!(line.contains(",direct,dist:"), "{line}");
    assert_eq!(d.stats().max_distance_label.as_deref(), Some("Lübeck-Node"));
}

#[test]
fn sqlite_table_serves_the_same_lookups() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("zipcodes.db");
    let conn = rusqlite::Connection::open(&path).unwrap();
    conn.execute_batch(
        "CREATE TABLE zipcodes (zipcode TEXT, city TEXT, prefix TEXT, latitude REAL, longitude REAL);
         INSERT INTO zipcodes VALUES ('22765', 'Hamburg', '040', 53.5544, 9.9284);",
    )
    .unwrap();
    drop(conn);

    let table = Arc::new(SqliteLocationTable::open(&path).unwrap());
    let sqlite = DistanceResolver::new(Some(HOME), table);
    let memory = DistanceResolver::new(Some(HOME), Arc::new(location_table()));
    let a = sqlite.resolve(DistanceQuery::Zipcode("22765"));
    let b = memory.resolve(DistanceQuery::Zipcode("22765"));
    assert_eq!(a, b);
    assert_eq!(sqlite.resolve(DistanceQuery::PhonePrefix("040")).place.as_deref(), Some("Hamburg"));
}
