use chrono::{DateTime, TimeZone, Utc};
use logfleet_core::{FleetState, HostAgentState, HostSpec, QueryRequest, QueryResponse};
use logfleet_engine::scripted::{scripted_message, ScriptedFleet, ScriptedHost};
use logfleet_engine::{EngineConfig, FleetEngine, FleetHandle};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

fn ts(sec: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + sec, 0).single().unwrap()
}

fn fast_config() -> EngineConfig {
    EngineConfig {
        connect_timeout: Duration::from_millis(500),
        round_timeout: Duration::from_secs(2),
        backoff_base: Duration::from_millis(5),
        backoff_cap: Duration::from_millis(20),
        retry_budget: 3,
        ..EngineConfig::default()
    }
}

fn request(from: i64, to: i64, query: &str) -> QueryRequest {
    QueryRequest {
        from: ts(from),
        to: ts(to),
        query: query.to_string(),
        load_earlier: false,
    }
}

fn load_earlier(from: i64, to: i64, query: &str) -> QueryRequest {
    QueryRequest {
        load_earlier: true,
        ..request(from, to, query)
    }
}

async fn wait_for_state<F>(rx: &mut watch::Receiver<FleetState>, mut pred: F) -> FleetState
where
    F: FnMut(&FleetState) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            {
                let state = rx.borrow_and_update();
                if pred(&state) {
                    return state.clone();
                }
            }
            rx.changed().await.expect("engine stopped");
        }
    })
    .await
    .expect("fleet state condition not reached")
}

async fn wait_for_response<F>(
    rx: &mut watch::Receiver<Option<QueryResponse>>,
    mut pred: F,
) -> QueryResponse
where
    F: FnMut(&QueryResponse) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            {
                let current = rx.borrow_and_update();
                if let Some(resp) = current.as_ref() {
                    if pred(resp) {
                        return resp.clone();
                    }
                }
            }
            rx.changed().await.expect("engine stopped");
        }
    })
    .await
    .expect("query response condition not reached")
}

async fn wait_all_idle(handle: &FleetHandle, count: usize) {
    let mut state_rx = handle.state();
    wait_for_state(&mut state_rx, |s| {
        s.hosts_in(HostAgentState::ConnectedIdle) == count
    })
    .await;
}

/// Assert the merged sequence is ascending except where the skew flag
/// marks a deliberate regression.
fn assert_ordered_modulo_flags(resp: &QueryResponse) {
    let mut max_time: Option<DateTime<Utc>> = None;
    for msg in &resp.logs {
        if msg.decreased_timestamp {
            assert!(
                max_time.is_some_and(|max| msg.time < max),
                "flagged message at {} does not regress",
                msg.time
            );
        } else {
            assert!(
                max_time.map_or(true, |max| msg.time >= max),
                "unflagged message at {} regresses",
                msg.time
            );
            max_time = Some(msg.time);
        }
    }
}

#[tokio::test]
async fn three_hosts_merge_ascending_with_skew_flagged() {
    let mut fleet = ScriptedFleet::new();
    fleet.add_host(
        "web-01",
        ScriptedHost::with_lines(vec![
            scripted_message("web-01", ts(0), "a0"),
            scripted_message("web-01", ts(120), "a1"),
            scripted_message("web-01", ts(240), "a2"),
            scripted_message("web-01", ts(360), "a3"),
        ]),
    );
    // web-02's log contains a timestamp regression.
    fleet.add_host(
        "web-02",
        ScriptedHost::with_lines(vec![
            scripted_message("web-02", ts(60), "b0"),
            scripted_message("web-02", ts(300), "b1"),
            scripted_message("web-02", ts(180), "b2 skewed"),
        ]),
    );
    fleet.add_host(
        "web-03",
        ScriptedHost::with_lines(vec![
            scripted_message("web-03", ts(30), "c0"),
            scripted_message("web-03", ts(90), "c1"),
        ]),
    );

    let handle = FleetEngine::spawn(
        vec![
            HostSpec::new("web-01"),
            HostSpec::new("web-02"),
            HostSpec::new("web-03"),
        ],
        Arc::new(fleet),
        fast_config(),
    );
    wait_all_idle(&handle, 3).await;

    handle.query(request(0, 3600, "")).unwrap();
    let mut resp_rx = handle.responses();
    let resp = wait_for_response(&mut resp_rx, |r| r.logs.len() == 9).await;

    assert_ordered_modulo_flags(&resp);
    let flagged: Vec<_> = resp
        .logs
        .iter()
        .filter(|m| m.decreased_timestamp)
        .map(|m| m.msg.clone())
        .collect();
    assert_eq!(flagged, vec!["b2 skewed"]);

    // Whole-minute range, nothing truncated: histogram total matches.
    assert_eq!(resp.num_msgs_total, 9);
    let histogram_total: u64 = resp.minute_stats.values().map(|s| s.num_msgs).sum();
    assert_eq!(histogram_total, resp.num_msgs_total);
    assert!(!resp.loaded_earlier);

    handle.shutdown();
}

#[tokio::test]
async fn errored_host_leaves_buckets_but_stays_counted() {
    let mut fleet = ScriptedFleet::new();
    fleet.add_host(
        "web-01",
        ScriptedHost::with_lines(vec![scripted_message("web-01", ts(10), "a")]),
    );
    fleet.add_host(
        "web-02",
        ScriptedHost::with_lines(vec![scripted_message("web-02", ts(20), "b")]),
    );
    let poisoned = fleet.add_host(
        "web-03",
        ScriptedHost::with_lines(vec![scripted_message("web-03", ts(30), "c")]),
    );

    let handle = FleetEngine::spawn(
        vec![
            HostSpec::new("web-01"),
            HostSpec::new("web-02"),
            HostSpec::new("web-03"),
        ],
        Arc::new(fleet),
        fast_config(),
    );
    wait_all_idle(&handle, 3).await;

    let mut resp_rx = handle.responses();
    handle.query(request(0, 3600, "")).unwrap();
    wait_for_response(&mut resp_rx, |r| r.logs.len() == 3).await;

    // The host starts failing fatally mid-session.
    poisoned.poison();
    handle.query(request(0, 3600, "")).unwrap();

    let mut state_rx = handle.state();
    let state = wait_for_state(&mut state_rx, |s| {
        s.hosts_in(HostAgentState::Errored) == 1
    })
    .await;
    assert_eq!(state.num_hosts, 3);
    assert_eq!(state.hosts_in(HostAgentState::ConnectedBusy), 0);
    assert!(state.connected);

    let resp = wait_for_response(&mut resp_rx, |r| r.logs.len() == 2).await;
    assert!(resp.logs.iter().all(|m| m.host.as_str() != "web-03"));

    // A later round simply goes on without the errored host.
    handle.query(request(0, 3600, "")).unwrap();
    let resp = wait_for_response(&mut resp_rx, |r| r.logs.len() == 2).await;
    assert_eq!(resp.num_msgs_total, 2);

    handle.shutdown();
}

#[tokio::test]
async fn load_earlier_pages_backward_without_losing_totals() {
    let lines: Vec<_> = (0..10)
        .map(|i| scripted_message("web-01", ts(i * 60), &format!("m{i}")))
        .collect();
    let mut fleet = ScriptedFleet::new();
    fleet.add_host("web-01", ScriptedHost::with_lines(lines));

    let config = EngineConfig {
        window_cap: 4,
        max_lines_per_host: 4,
        ..fast_config()
    };
    let handle = FleetEngine::spawn(vec![HostSpec::new("web-01")], Arc::new(fleet), config);
    wait_all_idle(&handle, 1).await;

    let mut resp_rx = handle.responses();
    handle.query(request(0, 600, "")).unwrap();
    let first = wait_for_response(&mut resp_rx, |r| r.logs.len() == 4).await;
    assert_eq!(first.logs.first().unwrap().time, ts(360));
    assert_eq!(first.num_msgs_total, 4);
    assert!(!first.loaded_earlier);

    handle.query(load_earlier(0, 600, "")).unwrap();
    let second = wait_for_response(&mut resp_rx, |r| r.logs.len() == 8).await;
    assert_eq!(second.logs.first().unwrap().time, ts(120));
    assert!(second.logs.first().unwrap().time < first.logs.first().unwrap().time);
    assert!(second.num_msgs_total >= first.num_msgs_total);
    assert_eq!(second.num_msgs_total, 8);
    assert!(second.loaded_earlier);
    assert_ordered_modulo_flags(&second);

    handle.query(load_earlier(0, 600, "")).unwrap();
    let third = wait_for_response(&mut resp_rx, |r| r.logs.len() == 10).await;
    assert_eq!(third.logs.first().unwrap().time, ts(0));
    assert_eq!(third.num_msgs_total, 10);

    // Nothing older remains; the next request answers immediately and
    // totals never decrease.
    handle.query(load_earlier(0, 600, "")).unwrap();
    let fourth = wait_for_response(&mut resp_rx, |r| r.num_msgs_total == 10).await;
    assert_eq!(fourth.logs.len(), 10);
    assert!(fourth.loaded_earlier);

    handle.shutdown();
}

#[tokio::test]
async fn tied_timestamps_at_the_cap_survive_pagination() {
    // A burst of identically-timestamped lines straddles the per-host line
    // cap; paging backward must still reach every message exactly once.
    let mut fleet = ScriptedFleet::new();
    fleet.add_host(
        "web-01",
        ScriptedHost::with_lines(vec![
            scripted_message("web-01", ts(0), "before burst"),
            scripted_message("web-01", ts(120), "burst a"),
            scripted_message("web-01", ts(120), "burst b"),
            scripted_message("web-01", ts(120), "burst c"),
            scripted_message("web-01", ts(240), "after burst"),
        ]),
    );

    let config = EngineConfig {
        window_cap: 5,
        max_lines_per_host: 2,
        ..fast_config()
    };
    let handle = FleetEngine::spawn(vec![HostSpec::new("web-01")], Arc::new(fleet), config);
    wait_all_idle(&handle, 1).await;

    let mut resp_rx = handle.responses();
    handle.query(request(0, 600, "")).unwrap();
    let first = wait_for_response(&mut resp_rx, |r| r.num_msgs_total == 4).await;
    assert_eq!(first.logs.len(), 4);
    assert_eq!(first.logs.first().unwrap().time, ts(120));

    handle.query(load_earlier(0, 600, "")).unwrap();
    let second = wait_for_response(&mut resp_rx, |r| r.num_msgs_total == 5).await;
    assert_eq!(second.logs.len(), 5);
    assert_eq!(second.logs.first().unwrap().time, ts(0));
    assert_ordered_modulo_flags(&second);
    let histogram_total: u64 = second.minute_stats.values().map(|s| s.num_msgs).sum();
    assert_eq!(histogram_total, 5);

    handle.shutdown();
}

#[tokio::test]
async fn narrowing_filter_tears_down_inflight_host() {
    let mut fleet = ScriptedFleet::new();
    fleet.add_host(
        "web-01",
        ScriptedHost::with_lines(vec![scripted_message("web-01", ts(10), "fast")]),
    );
    let mut slow = ScriptedHost::with_lines(vec![scripted_message("db-01", ts(20), "slow")]);
    slow.query_delay = Duration::from_millis(300);
    fleet.add_host("db-01", slow);

    let handle = FleetEngine::spawn(
        vec![HostSpec::new("web-01"), HostSpec::new("db-01")],
        Arc::new(fleet),
        fast_config(),
    );
    wait_all_idle(&handle, 2).await;

    let mut resp_rx = handle.responses();
    handle.query(request(0, 3600, "")).unwrap();
    // Narrow the filter while db-01 is still working on the round.
    handle.set_hosts_filter("web-*").unwrap();

    let mut state_rx = handle.state();
    let state = wait_for_state(&mut state_rx, |s| s.num_hosts == 1).await;
    assert_eq!(state.num_unused, 1);
    assert!(!state.no_matching_hosts);

    let resp = wait_for_response(&mut resp_rx, |r| !r.logs.is_empty()).await;
    assert!(resp.logs.iter().all(|m| m.host.as_str() == "web-01"));

    // Give the slow host time to finish; its output must stay dropped.
    tokio::time::sleep(Duration::from_millis(400)).await;
    let current = resp_rx.borrow().clone().unwrap();
    assert!(current.logs.iter().all(|m| m.host.as_str() == "web-01"));

    handle.shutdown();
}

#[tokio::test]
async fn rapid_resubmission_delivers_only_the_newest_generation() {
    let mut script = ScriptedHost::with_lines(vec![
        scripted_message("web-01", ts(10), "first batch"),
        scripted_message("web-01", ts(20), "second batch"),
    ]);
    script.query_delay = Duration::from_millis(100);
    let mut fleet = ScriptedFleet::new();
    fleet.add_host("web-01", script);

    let handle = FleetEngine::spawn(vec![HostSpec::new("web-01")], Arc::new(fleet), fast_config());
    wait_all_idle(&handle, 1).await;

    let mut resp_rx = handle.responses();
    handle.query(request(0, 3600, "first")).unwrap();
    handle.query(request(0, 3600, "second")).unwrap();

    let resp = wait_for_response(&mut resp_rx, |r| !r.logs.is_empty()).await;
    assert_eq!(resp.logs.len(), 1);
    assert_eq!(resp.logs[0].msg, "second batch");

    // Even after the superseded work had time to complete, the published
    // response still belongs to the newer request.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let current = resp_rx.borrow().clone().unwrap();
    assert_eq!(current.logs.len(), 1);
    assert_eq!(current.logs[0].msg, "second batch");

    handle.shutdown();
}

#[tokio::test]
async fn empty_filter_match_is_a_state_not_an_error() {
    let mut fleet = ScriptedFleet::new();
    fleet.add_host("web-01", ScriptedHost::default());
    fleet.add_host("web-02", ScriptedHost::default());

    let handle = FleetEngine::spawn(
        vec![HostSpec::new("web-01"), HostSpec::new("web-02")],
        Arc::new(fleet),
        fast_config(),
    );
    wait_all_idle(&handle, 2).await;

    handle.set_hosts_filter("tape-archive-*").unwrap();
    let mut state_rx = handle.state();
    let state = wait_for_state(&mut state_rx, |s| s.no_matching_hosts).await;
    assert_eq!(state.num_hosts, 0);
    assert_eq!(state.num_unused, 2);
    assert!(!state.busy);

    // Widening the filter brings the hosts back.
    handle.set_hosts_filter("web-*").unwrap();
    let state = wait_for_state(&mut state_rx, |s| {
        s.hosts_in(HostAgentState::ConnectedIdle) == 2
    })
    .await;
    assert!(!state.no_matching_hosts);
    assert_eq!(state.num_hosts, 2);

    handle.shutdown();
}

#[tokio::test]
async fn identical_requery_yields_equal_response() {
    let mut fleet = ScriptedFleet::new();
    fleet.add_host(
        "web-01",
        ScriptedHost::with_lines(vec![
            scripted_message("web-01", ts(10), "one"),
            scripted_message("web-01", ts(70), "two"),
        ]),
    );
    fleet.add_host(
        "web-02",
        ScriptedHost::with_lines(vec![scripted_message("web-02", ts(40), "three")]),
    );

    let handle = FleetEngine::spawn(
        vec![HostSpec::new("web-01"), HostSpec::new("web-02")],
        Arc::new(fleet),
        fast_config(),
    );
    wait_all_idle(&handle, 2).await;

    let mut resp_rx = handle.responses();
    handle.query(request(0, 3600, "")).unwrap();
    let first = wait_for_response(&mut resp_rx, |r| r.logs.len() == 3).await;

    handle.query(request(0, 3600, "")).unwrap();
    let second = wait_for_response(&mut resp_rx, |r| r.logs.len() == 3).await;

    assert_eq!(first, second);
    handle.shutdown();
}

#[tokio::test]
async fn query_submitted_before_connectivity_fires_once_connected() {
    let script = ScriptedHost::with_lines(vec![scripted_message("web-01", ts(10), "late")]);
    script
        .fail_connects
        .store(1, std::sync::atomic::Ordering::SeqCst);
    let mut fleet = ScriptedFleet::new();
    fleet.add_host("web-01", script);

    let handle = FleetEngine::spawn(vec![HostSpec::new("web-01")], Arc::new(fleet), fast_config());

    // Submit while the only host is still failing its first connect.
    handle.query(request(0, 3600, "")).unwrap();

    let mut resp_rx = handle.responses();
    let resp = wait_for_response(&mut resp_rx, |r| !r.logs.is_empty()).await;
    assert_eq!(resp.logs[0].msg, "late");

    handle.shutdown();
}
