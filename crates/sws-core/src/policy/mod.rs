//! The identity, mismatch, and BOLO decision engine.
//!
//! Everything here is a pure query over the record store plus the
//! identity report of the connecting client. The functions return
//! verdicts; acting on them (blacklisting, closing, alerting) is the
//! session layer's job.
//!
//! Three verdict families exist:
//!
//! - **blacklist links** hard-fail the connection and blacklist the key
//! - **mismatches** close the connection without blacklisting
//! - **association hits** and **BOLO bits** are soft signals that are
//!   only logged or alerted

mod universe;

pub use universe::Universe;

use crate::protocol::{AnalyticsInfo, FingerprintInfo, JoinInfo, SessionInfo};
use crate::record::{Params, Record, RecordStore, StoreError};

/// Client installation id that is always treated as blacklisted. Ships
/// with a widely redistributed tampered client.
pub const POISONED_CLIENT_ID: &str = "CF8CFE86-CC2E-4D43-BC84-2D4BF8DC19BF";

/// Blacklisted rows sharing an IP before the IP itself counts as linked.
const IP_LINK_THRESHOLD: usize = 3;

/// Strict lower bound for the workspace overlap ratio.
const WORKSPACE_OVERLAP_THRESHOLD: f64 = 0.33;

/// Group ids on the association deny list.
const MARKED_GROUPS: &[u64] = &[15_326_583, 33_987_101, 33_987_290, 33_423_445];

/// Followed-account ids on the association deny list.
const MARKED_FOLLOWING: &[u64] = &[
    112_508_646,
    3_657_821_880,
    5_463_447_056,
    141_656_968,
    4_379_286_741,
    972_539_685,
    2_046_352_519,
];

/// Friend-account ids on the association deny list.
const MARKED_FRIENDS: &[u64] = &[
    112_508_646,
    3_785_665_504,
    507_068_593,
    903_387_145,
    1_820_675_350,
    1_447_245_226,
    4_140_622_609,
    5_130_605_718,
    5_509_363_709,
    3_721_348_630,
    3_657_821_880,
    5_463_447_056,
    141_656_968,
    4_379_286_741,
    972_539_685,
    1_774_109_388,
    3_785_813_007,
    3_764_384_754,
    3_785_846_669,
    3_785_692_778,
    3_785_665_504,
    3_785_640_866,
    2_046_352_519,
];

/// Username substrings on the association deny list.
const MARKED_USERNAME_1: &str = "UVProphet";
const MARKED_USERNAME_2: &str = "FlVEFOOTTWO";

/// Outcome codes surfaced in close reasons and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Outcome {
    /// No finding.
    Success = 0,
    /// Account is in a marked group.
    GroupAssociation = 1,
    /// Account follows a marked account.
    FollowingAssociation = 2,
    /// Account is friends with a marked account.
    FriendsAssociation = 3,
    /// Username contains the first marked substring.
    UsernameAssociation1 = 4,
    /// Username contains the second marked substring.
    UsernameAssociation2 = 5,
    /// Fingerprint HWID is shared with a blacklisted key.
    FingerprintMatch = 6,
    /// IP is shared with enough blacklisted keys.
    IpMatch = 7,
    /// Client installation id is the poisoned GUID.
    StaticClientIdMatch = 8,
    /// Hardware id changed since first identify.
    HwidMismatch = 9,
    /// Exploit name changed since first identify.
    ExploitMismatch = 10,
    /// Device type changed since first identify.
    DeviceTypeMismatch = 11,
    /// Locale changed since first identify.
    LocaleMismatch = 12,
    /// Region changed since first identify.
    RegionMismatch = 13,
    /// Daylight savings flag changed since first identify.
    DstMismatch = 14,
}

impl Outcome {
    /// Numeric code used in client-visible reasons.
    #[must_use]
    pub fn code(self) -> u32 {
        self as u32
    }
}

/// How the BOLO session probe derives its session time value.
///
/// Older clients reported a raw process clock; newer ones report the
/// clock offset that the server turns back into an absolute start time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CpuStartMode {
    /// `round2(base_timestamp - os_clock)`; the intended form.
    #[default]
    Derived,
    /// Use the reported clock value unmodified.
    Raw,
}

/// Bit set over the BOLO signal kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BoloMask(u8);

impl BoloMask {
    /// A session identifier or source IP matched a flagged key.
    pub const SESSION: Self = Self(1);
    /// The account id matched a flagged key's join.
    pub const JOIN: Self = Self(1 << 1);
    /// The workspace scan overlapped a flagged key's session.
    pub const WORKSPACE: Self = Self(1 << 2);

    /// No bits set.
    #[must_use]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Whether every bit of `other` is set.
    #[must_use]
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Set the bits of `other`.
    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    /// Raw bits, for logging.
    #[must_use]
    pub fn bits(self) -> u8 {
        self.0
    }
}

/// The session time value used for session matching, per the configured
/// mode.
#[must_use]
pub fn cpu_start(mode: CpuStartMode, base_timestamp: u64, os_clock: f64) -> f64 {
    match mode {
        CpuStartMode::Derived => round2(base_timestamp as f64 - os_clock),
        CpuStartMode::Raw => os_clock,
    }
}

/// Round to two decimal places, half away from zero.
#[must_use]
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Check whether this connection is linked to blacklisted keys.
///
/// A hit means the key gets blacklisted, not just dropped. The IP link
/// requires at least three distinct blacklisted rows; the query asks
/// for exactly that many so the threshold can actually trigger.
///
/// # Errors
///
/// Propagates store failures.
pub fn check_blacklist(
    store: &dyn RecordStore,
    ip: &str,
    fingerprint: &FingerprintInfo,
    session: &SessionInfo,
) -> Result<Option<Outcome>, StoreError> {
    let hwid_link = store.find_first_record_by_filter(
        "fingerprints",
        "key.blacklist != null && (exploitHwid = {:exploitHwid})",
        &Params::new().set("exploitHwid", fingerprint.exploit_hwid.as_str()),
    )?;
    if hwid_link.is_some() {
        return Ok(Some(Outcome::FingerprintMatch));
    }

    let ip_links = store.find_records_by_filter(
        "fingerprints",
        "key.blacklist != null && (ipAddress = {:ipAddress})",
        &Params::new().set("ipAddress", ip),
        IP_LINK_THRESHOLD,
        0,
    )?;
    if ip_links.len() >= IP_LINK_THRESHOLD {
        return Ok(Some(Outcome::IpMatch));
    }

    if session.roblox_client_id == POISONED_CLIENT_ID {
        return Ok(Some(Outcome::StaticClientIdMatch));
    }

    Ok(None)
}

/// Compare the report against the key's pinned fingerprint and
/// analytics rows.
///
/// Any difference closes the connection with a "reset your HWID" reason
/// but leaves the key alone.
#[must_use]
pub fn check_mismatch(
    fingerprint: &FingerprintInfo,
    fingerprint_row: &Record,
    analytics_row: &Record,
    analytics: &AnalyticsInfo,
    exploit_name: &str,
) -> Option<Outcome> {
    if fingerprint_row.get_str("exploitHwid") != fingerprint.exploit_hwid {
        return Some(Outcome::HwidMismatch);
    }
    if fingerprint_row.get_str("exploitName") != exploit_name {
        return Some(Outcome::ExploitMismatch);
    }
    if fingerprint_row.get_i64("deviceType") != i64::from(fingerprint.device_type) {
        return Some(Outcome::DeviceTypeMismatch);
    }
    if analytics_row.get_str("locale") != analytics.system_locale_id {
        return Some(Outcome::LocaleMismatch);
    }
    if analytics_row.get_str("region") != analytics.region {
        return Some(Outcome::RegionMismatch);
    }
    if analytics_row.get_bool("dst") != analytics.daylight_savings_time {
        return Some(Outcome::DstMismatch);
    }

    None
}

/// Test the join context against the hard-coded deny lists.
///
/// Hits are logged by the caller; they never close the connection.
#[must_use]
pub fn check_association(join: &JoinInfo) -> Vec<Outcome> {
    let mut hits = Vec::new();

    if !Universe::new(MARKED_GROUPS)
        .slice_matches(&join.user_groups)
        .is_empty()
    {
        hits.push(Outcome::GroupAssociation);
    }
    if !Universe::new(MARKED_FOLLOWING)
        .slice_matches(&join.user_following)
        .is_empty()
    {
        hits.push(Outcome::FollowingAssociation);
    }
    if !Universe::new(MARKED_FRIENDS)
        .slice_matches(&join.user_friends)
        .is_empty()
    {
        hits.push(Outcome::FriendsAssociation);
    }
    if join.user_name.contains(MARKED_USERNAME_1) {
        hits.push(Outcome::UsernameAssociation1);
    }
    if join.user_name.contains(MARKED_USERNAME_2) {
        hits.push(Outcome::UsernameAssociation2);
    }

    hits
}

/// Evaluate the BOLO probes for one identify.
///
/// A non-empty mask triggers an alert on the project webhook; it never
/// closes the connection.
///
/// # Errors
///
/// Propagates store failures.
pub fn bolo_mask(
    store: &dyn RecordStore,
    ip: &str,
    session: &SessionInfo,
    join: &JoinInfo,
    base_timestamp: u64,
    mode: CpuStartMode,
) -> Result<BoloMask, StoreError> {
    let mut mask = BoloMask::default();

    let flagged_ip = store.find_first_record_by_filter(
        "fingerprints",
        "key.bolo != false && (ipAddress = {:ipAddress})",
        &Params::new().set("ipAddress", ip),
    )?;
    if flagged_ip.is_some() {
        mask.insert(BoloMask::SESSION);
    }

    let probe = cpu_start(mode, base_timestamp, session.os_clock);
    let flagged_session = store.find_first_record_by_filter(
        "sessions",
        "subscription.key.bolo == true && (cpuStart = {:cpuStart} || playSessionId = {:playSessionId} || robloxSessionId = {:robloxSessionId})",
        &Params::new()
            .set("cpuStart", probe)
            .set("playSessionId", session.play_session_id.as_str())
            .set("robloxSessionId", session.roblox_session_id.as_str()),
    )?;
    if flagged_session.is_some() {
        mask.insert(BoloMask::SESSION);
    }

    let flagged_join = store.find_first_record_by_filter(
        "joins",
        "subscription.key.bolo == true && userId = {:userId}",
        &Params::new().set("userId", join.user_id),
    )?;
    if flagged_join.is_some() {
        mask.insert(BoloMask::JOIN);
    }

    let flagged_sessions = store.find_records_by_filter(
        "sessions",
        "subscription.key.bolo == true",
        &Params::new(),
        0,
        0,
    )?;
    if partial_match_sessions(&session.workspace_scan, &flagged_sessions) {
        mask.insert(BoloMask::WORKSPACE);
    }

    Ok(mask)
}

/// Whether any stored session's workspace scan overlaps the incoming
/// one past the threshold.
fn partial_match_sessions(scan: &[String], sessions: &[Record]) -> bool {
    sessions.iter().any(|session| {
        workspace_overlap(scan, session.get_str_list("workspaceScan")) > WORKSPACE_OVERLAP_THRESHOLD
    })
}

/// Fraction of the incoming scan that exact-matches entries of a stored
/// scan. Zero when the incoming scan is empty.
#[must_use]
pub fn workspace_overlap(scan: &[String], stored: &[String]) -> f64 {
    if scan.is_empty() {
        return 0.0;
    }

    let hits = scan
        .iter()
        .map(|path| stored.iter().filter(|other| *other == path).count())
        .sum::<usize>();

    if hits == 0 {
        return 0.0;
    }

    hits as f64 / scan.len() as f64
}

#[cfg(test)]
mod tests {
    use crate::record::{FieldMap, MemoryStore, Value};

    use super::*;

    fn fingerprint() -> FingerprintInfo {
        FingerprintInfo {
            device_type: 1,
            exploit_hwid: "HW-A".to_owned(),
        }
    }

    fn session() -> SessionInfo {
        SessionInfo {
            os_clock: 100.0,
            play_session_id: "play-1".to_owned(),
            roblox_session_id: "rbx-1".to_owned(),
            roblox_client_id: "client-1".to_owned(),
            workspace_scan: Vec::new(),
            log_history: Vec::new(),
        }
    }

    fn join() -> JoinInfo {
        JoinInfo {
            user_name: "somebody".to_owned(),
            user_id: 555,
            account_age: 100,
            place_id: 42,
            user_groups: Vec::new(),
            user_following: Vec::new(),
            user_friends: Vec::new(),
        }
    }

    fn seed_blacklisted_fingerprint(store: &MemoryStore, n: usize, ip: &str) {
        store
            .create(
                "keys",
                FieldMap::from([
                    ("id".to_owned(), Value::from(format!("BK{n}"))),
                    ("blacklist".to_owned(), Value::from("banned")),
                ]),
            )
            .unwrap();
        store
            .create(
                "fingerprints",
                FieldMap::from([
                    ("key".to_owned(), Value::from(format!("BK{n}"))),
                    ("ipAddress".to_owned(), Value::from(ip)),
                    ("exploitHwid".to_owned(), Value::from(format!("BHW{n}"))),
                ]),
            )
            .unwrap();
    }

    #[test]
    fn hwid_link_blacklists() {
        let store = MemoryStore::new();
        store
            .create(
                "keys",
                FieldMap::from([
                    ("id".to_owned(), Value::from("BK1")),
                    ("blacklist".to_owned(), Value::from("banned")),
                ]),
            )
            .unwrap();
        store
            .create(
                "fingerprints",
                FieldMap::from([
                    ("key".to_owned(), Value::from("BK1")),
                    ("exploitHwid".to_owned(), Value::from("HW-A")),
                ]),
            )
            .unwrap();

        let outcome = check_blacklist(&store, "9.9.9.9", &fingerprint(), &session()).unwrap();
        assert_eq!(outcome, Some(Outcome::FingerprintMatch));
    }

    #[test]
    fn ip_link_needs_three_rows() {
        let store = MemoryStore::new();
        seed_blacklisted_fingerprint(&store, 1, "1.1.1.1");
        seed_blacklisted_fingerprint(&store, 2, "1.1.1.1");

        // Two matching rows are not enough.
        let outcome = check_blacklist(&store, "1.1.1.1", &fingerprint(), &session()).unwrap();
        assert_eq!(outcome, None);

        seed_blacklisted_fingerprint(&store, 3, "1.1.1.1");
        let outcome = check_blacklist(&store, "1.1.1.1", &fingerprint(), &session()).unwrap();
        assert_eq!(outcome, Some(Outcome::IpMatch));
    }

    #[test]
    fn poisoned_client_id_blacklists() {
        let store = MemoryStore::new();
        let mut report = session();
        report.roblox_client_id = POISONED_CLIENT_ID.to_owned();

        let outcome = check_blacklist(&store, "9.9.9.9", &fingerprint(), &report).unwrap();
        assert_eq!(outcome, Some(Outcome::StaticClientIdMatch));
    }

    #[test]
    fn mismatch_checks_each_pinned_field() {
        let fp_row = Record {
            id: "f1".to_owned(),
            collection: "fingerprints".to_owned(),
            fields: FieldMap::from([
                ("exploitHwid".to_owned(), Value::from("HW-A")),
                ("exploitName".to_owned(), Value::from("ToolX")),
                ("deviceType".to_owned(), Value::from(1u8)),
            ]),
        };
        let an_row = Record {
            id: "a1".to_owned(),
            collection: "analytics".to_owned(),
            fields: FieldMap::from([
                ("locale".to_owned(), Value::from("en-US")),
                ("region".to_owned(), Value::from("US")),
                ("dst".to_owned(), Value::from(true)),
            ]),
        };
        let analytics = AnalyticsInfo {
            system_locale_id: "en-US".to_owned(),
            output_devices: Vec::new(),
            input_devices: Vec::new(),
            has_hyperion: false,
            has_touchscreen: false,
            has_gyroscope: false,
            gpu_memory: 0,
            timezone: "America/Chicago".to_owned(),
            region: "US".to_owned(),
            daylight_savings_time: true,
        };

        assert_eq!(
            check_mismatch(&fingerprint(), &fp_row, &an_row, &analytics, "ToolX"),
            None
        );

        assert_eq!(
            check_mismatch(&fingerprint(), &fp_row, &an_row, &analytics, "OtherTool"),
            Some(Outcome::ExploitMismatch)
        );

        let mut changed = fingerprint();
        changed.exploit_hwid = "HW-B".to_owned();
        assert_eq!(
            check_mismatch(&changed, &fp_row, &an_row, &analytics, "ToolX"),
            Some(Outcome::HwidMismatch)
        );

        let mut moved = analytics.clone();
        moved.region = "DE".to_owned();
        assert_eq!(
            check_mismatch(&fingerprint(), &fp_row, &an_row, &moved, "ToolX"),
            Some(Outcome::RegionMismatch)
        );
    }

    #[test]
    fn association_hits_accumulate() {
        let mut report = join();
        report.user_groups = vec![33_423_445];
        report.user_name = "xXUVProphetXx".to_owned();

        let hits = check_association(&report);
        assert_eq!(
            hits,
            vec![Outcome::GroupAssociation, Outcome::UsernameAssociation1]
        );

        assert!(check_association(&join()).is_empty());
    }

    #[test]
    fn workspace_overlap_threshold_is_strict() {
        let stored: Vec<String> = vec!["a".into(), "b".into(), "c".into()];

        // 1 of 3 matching is not over the threshold (0.333.. > 0.33 is
        // though, so use 1 of 4 for the negative case).
        let scan: Vec<String> = vec!["a".into(), "x".into(), "y".into(), "z".into()];
        assert!(workspace_overlap(&scan, &stored) <= WORKSPACE_OVERLAP_THRESHOLD);

        let scan: Vec<String> = vec!["a".into(), "b".into(), "x".into()];
        assert!(workspace_overlap(&scan, &stored) > WORKSPACE_OVERLAP_THRESHOLD);

        assert_eq!(workspace_overlap(&[], &stored), 0.0);
    }

    #[test]
    fn derived_cpu_start_rounds_to_two_places() {
        assert_eq!(cpu_start(CpuStartMode::Derived, 1000, 123.456), 876.54);
        assert_eq!(cpu_start(CpuStartMode::Raw, 1000, 123.456), 123.456);
    }

    fn seed_bolo_session(store: &MemoryStore, fields: FieldMap) {
        store
            .create(
                "keys",
                FieldMap::from([
                    ("id".to_owned(), Value::from("BOLO1")),
                    ("bolo".to_owned(), Value::from(true)),
                ]),
            )
            .unwrap();
        store
            .create(
                "subscriptions",
                FieldMap::from([
                    ("id".to_owned(), Value::from("SUB1")),
                    ("key".to_owned(), Value::from("BOLO1")),
                ]),
            )
            .unwrap();
        let mut fields = fields;
        fields.insert("subscription".to_owned(), Value::from("SUB1"));
        store.create("sessions", fields).unwrap();
    }

    #[test]
    fn bolo_session_matches_derived_time() {
        let store = MemoryStore::new();
        // A flagged session whose cpuStart equals the derived probe.
        seed_bolo_session(
            &store,
            FieldMap::from([("cpuStart".to_owned(), Value::from(876.54))]),
        );

        let mut report = session();
        report.os_clock = 123.456;
        report.play_session_id = "other".to_owned();
        report.roblox_session_id = "other".to_owned();

        let mask = bolo_mask(&store, "9.9.9.9", &report, &join(), 1000, CpuStartMode::Derived)
            .unwrap();
        assert!(mask.contains(BoloMask::SESSION));

        let mask =
            bolo_mask(&store, "9.9.9.9", &report, &join(), 1000, CpuStartMode::Raw).unwrap();
        assert!(mask.is_empty());
    }

    #[test]
    fn bolo_join_matches_user_id() {
        let store = MemoryStore::new();
        store
            .create(
                "keys",
                FieldMap::from([
                    ("id".to_owned(), Value::from("BOLO1")),
                    ("bolo".to_owned(), Value::from(true)),
                ]),
            )
            .unwrap();
        store
            .create(
                "subscriptions",
                FieldMap::from([
                    ("id".to_owned(), Value::from("SUB1")),
                    ("key".to_owned(), Value::from("BOLO1")),
                ]),
            )
            .unwrap();
        store
            .create(
                "joins",
                FieldMap::from([
                    ("subscription".to_owned(), Value::from("SUB1")),
                    ("userId".to_owned(), Value::from(555i64)),
                ]),
            )
            .unwrap();

        let mask = bolo_mask(
            &store,
            "9.9.9.9",
            &session(),
            &join(),
            1000,
            CpuStartMode::Derived,
        )
        .unwrap();
        assert!(mask.contains(BoloMask::JOIN));
    }

    #[test]
    fn bolo_workspace_matches_overlapping_scan() {
        let store = MemoryStore::new();
        seed_bolo_session(
            &store,
            FieldMap::from([(
                "workspaceScan".to_owned(),
                Value::from(vec!["a".to_owned(), "b".to_owned(), "c".to_owned()]),
            )]),
        );

        let mut report = session();
        report.workspace_scan = vec!["a".to_owned(), "b".to_owned()];

        let mask = bolo_mask(
            &store,
            "9.9.9.9",
            &report,
            &join(),
            1000,
            CpuStartMode::Derived,
        )
        .unwrap();
        assert!(mask.contains(BoloMask::WORKSPACE));
    }

    #[test]
    fn unflagged_rows_do_not_alert() {
        let store = MemoryStore::new();
        store
            .create(
                "keys",
                FieldMap::from([("id".to_owned(), Value::from("PLAIN"))]),
            )
            .unwrap();
        store
            .create(
                "fingerprints",
                FieldMap::from([
                    ("key".to_owned(), Value::from("PLAIN")),
                    ("ipAddress".to_owned(), Value::from("9.9.9.9")),
                ]),
            )
            .unwrap();

        let mask = bolo_mask(
            &store,
            "9.9.9.9",
            &session(),
            &join(),
            1000,
            CpuStartMode::Derived,
        )
        .unwrap();
        assert!(mask.is_empty());
    }
}
