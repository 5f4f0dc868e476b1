//! Two-engine scenarios over a lossless in-memory transport: fragmented
//! delivery, gap detection with REQ recovery, REQ rate limiting, and full
//! anti-entropy convergence.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use rfmp_engine::bloom::Window;
use rfmp_engine::{Config, Engine, ManualClock, MessageFilter};
use rfmp_shared::ax25::UiFrame;
use rfmp_shared::constants::DEFAULT_DESTINATION;
use rfmp_shared::frames::Frame;
use rfmp_shared::types::{Callsign, MessageId, Priority};

fn offline_config(callsign: &str, ssid: u8, dir: &std::path::Path) -> Config {
    let mut config = Config::default();
    config.node.callsign = callsign.into();
    config.node.ssid = ssid;
    config.network.offline_mode = true;
    config.storage.database_path = Some(dir.join(format!("{callsign}-{ssid}.db")));
    config
}

fn spawn_engine(
    callsign: &str,
    dir: &std::path::Path,
    clock: Arc<ManualClock>,
) -> (Engine, mpsc::Receiver<Vec<u8>>) {
    let engine = Engine::new(offline_config(callsign, 1, dir), clock).unwrap();
    let outbound = engine.take_outbound().unwrap();
    engine.start();
    (engine, outbound)
}

/// Pipe one engine's outbound frames into another engine's receive path.
/// Frames already buffered on the channel are delivered too.
fn bridge(mut from: mpsc::Receiver<Vec<u8>>, to: Engine) {
    tokio::spawn(async move {
        while let Some(frame) = from.recv().await {
            to.inject_ax25(&frame).await;
        }
    });
}

/// Advance both clocks in lockstep and let the loops run.
async fn run_for(clocks: &[&Arc<ManualClock>], simulated_secs: u64) {
    for _ in 0..simulated_secs {
        for clock in clocks {
            clock.advance_secs(1);
        }
        // Paused tokio time: sleeps auto-advance, loops interleave.
        tokio::time::sleep(Duration::from_millis(1100)).await;
    }
}

/// Drain every frame currently buffered on an outbound channel, i.e. lose
/// them on air.
fn drain(rx: &mut mpsc::Receiver<Vec<u8>>) -> Vec<Vec<u8>> {
    let mut frames = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        frames.push(frame);
    }
    frames
}

fn msg_id_of(frame_bytes: &[u8]) -> Option<MessageId> {
    let ui = UiFrame::decode(frame_bytes).ok()?;
    match Frame::decode(&ui.info).ok()? {
        Frame::Msg(msg) => Some(msg.id),
        _ => None,
    }
}

async fn stored_ids(engine: &Engine) -> HashSet<MessageId> {
    engine
        .query_messages(MessageFilter {
            limit: Some(1000),
            ..MessageFilter::default()
        })
        .await
        .unwrap()
        .into_iter()
        .map(|m| m.id)
        .collect()
}

#[tokio::test(start_paused = true)]
async fn fragmented_message_crosses_the_air() {
    let dir = tempfile::tempdir().unwrap();
    let clock_a = ManualClock::starting_at(1_700_000_000);
    let clock_b = ManualClock::starting_at(1_700_000_000);

    let (a, a_out) = spawn_engine("N0CALL", dir.path(), clock_a.clone());
    let (b, _b_out) = spawn_engine("K7XYZ", dir.path(), clock_b.clone());
    bridge(a_out, b.clone());

    let sent = a
        .submit_message("general", &"A".repeat(600), Priority::Normal, None, None)
        .await
        .unwrap();
    assert_eq!(a.status().await.unwrap().queue_depth, 4);

    run_for(&[&clock_a, &clock_b], 20).await;

    let received = b.get_message(&sent.id).await.unwrap().expect("reassembled");
    assert_eq!(received.body, sent.body);
    assert_eq!(received.from_node.to_string(), "N0CALL-1");

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn gap_detection_recovers_missing_messages() {
    let dir = tempfile::tempdir().unwrap();
    let clock_a = ManualClock::starting_at(1_700_000_000);
    let clock_b = ManualClock::starting_at(1_700_000_000);

    let (a, mut a_out) = spawn_engine("N0CALL", dir.path(), clock_a.clone());
    let (b, mut b_out) = spawn_engine("K7XYZ", dir.path(), clock_b.clone());

    // A transmits three messages, but only the first reaches B; the other
    // two are lost on air.
    let m1 = a
        .submit_message("general", "message one", Priority::Normal, None, None)
        .await
        .unwrap();
    let m2 = a
        .submit_message("general", "message two", Priority::Normal, None, None)
        .await
        .unwrap();
    let m3 = a
        .submit_message("general", "message three", Priority::Normal, None, None)
        .await
        .unwrap();

    run_for(&[&clock_a, &clock_b], 10).await;
    for frame in drain(&mut a_out) {
        if msg_id_of(&frame) == Some(m1.id) {
            b.inject_ax25(&frame).await;
        }
    }
    assert_eq!(stored_ids(&b).await, HashSet::from([m1.id]));

    // B has heard m2 and m3 referenced (an overheard REQ from a third
    // station), so they sit in its wanted set.
    let overheard = UiFrame::new(
        Callsign::parse("W1AW").unwrap(),
        Callsign::parse(DEFAULT_DESTINATION).unwrap(),
        Frame::Req(vec![m2.id, m3.id]).encode(),
    );
    b.inject_ax25(&overheard.encode()).await;

    // One-way link first: A's SYNC reaches B, whose filters claim m2/m3, so
    // B emits a REQ within two sync intervals.
    bridge(a_out, b.clone());
    let mut reqd = false;
    for _ in 0..4 {
        run_for(&[&clock_a, &clock_b], 30).await;
        if b.counters().reqs_sent >= 1 {
            reqd = true;
            break;
        }
    }
    assert!(reqd, "B never emitted a REQ for the gap");

    // The first REQ was lost with everything else B sent so far. Close the
    // return path; B re-requests after its per-message backoff and A
    // answers with the stored messages.
    let _ = drain(&mut b_out);
    bridge(b_out, a.clone());

    run_for(&[&clock_a, &clock_b], 120).await;

    let b_ids = stored_ids(&b).await;
    assert!(b_ids.contains(&m2.id), "m2 should arrive via REQ recovery");
    assert!(b_ids.contains(&m3.id), "m3 should arrive via REQ recovery");

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn disjoint_stores_converge_via_sync() {
    let dir = tempfile::tempdir().unwrap();
    let clock_a = ManualClock::starting_at(1_700_000_000);
    let clock_b = ManualClock::starting_at(1_700_000_000);

    let (a, mut a_out) = spawn_engine("N0CALL", dir.path(), clock_a.clone());
    let (b, mut b_out) = spawn_engine("K7XYZ", dir.path(), clock_b.clone());

    // Disjoint sets, all inside the current window. The initial broadcasts
    // are lost on air, so only anti-entropy can reconcile the stores.
    let mut expected = HashSet::new();
    for i in 0..3 {
        let m = a
            .submit_message("general", &format!("from a {i}"), Priority::Normal, None, None)
            .await
            .unwrap();
        expected.insert(m.id);
    }
    for i in 0..3 {
        let m = b
            .submit_message("general", &format!("from b {i}"), Priority::Normal, None, None)
            .await
            .unwrap();
        expected.insert(m.id);
    }

    run_for(&[&clock_a, &clock_b], 15).await;
    drain(&mut a_out);
    drain(&mut b_out);

    bridge(a_out, b.clone());
    bridge(b_out, a.clone());

    // 10 sync intervals = 300 simulated seconds.
    let mut converged = false;
    for _ in 0..10 {
        run_for(&[&clock_a, &clock_b], 30).await;
        if stored_ids(&a).await == expected && stored_ids(&b).await == expected {
            converged = true;
            break;
        }
    }
    assert!(converged, "stores did not converge within 10 sync intervals");

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn req_rate_stays_limited_under_sync_flood() {
    let dir = tempfile::tempdir().unwrap();
    let clock = ManualClock::starting_at(1_700_000_000);
    let (engine, _outbound) = spawn_engine("N0CALL", dir.path(), clock.clone());

    // 50 ids the engine has heard of but does not hold.
    let phantom_ids: Vec<MessageId> = (0..50u8)
        .map(|n| MessageId([n, 0xEE, 0, 0, 0, 0]))
        .collect();
    let seeder = UiFrame::new(
        Callsign::parse("W1AW").unwrap(),
        Callsign::parse(DEFAULT_DESTINATION).unwrap(),
        Frame::Req(phantom_ids.clone()).encode(),
    );
    engine.inject_ax25(&seeder.encode()).await;

    // A remote window claiming to hold every phantom id.
    let mut window = Window {
        opened_at: 1_700_000_000,
        salt: 0x5EED_CAFE,
        k: 4,
        m_log2: 10,
        bits: vec![0u8; 128],
        count: 0,
    };
    for id in &phantom_ids {
        window.insert(id);
    }
    let windows = vec![
        window.to_sync_window(),
        window.to_sync_window(),
        window.to_sync_window(),
    ];

    // 100 SYNCs from 10 peers over a simulated minute.
    for _ in 0..10 {
        for peer in 0..10 {
            let ui = UiFrame::new(
                Callsign::new("P", peer).unwrap(),
                Callsign::parse(DEFAULT_DESTINATION).unwrap(),
                Frame::Sync(windows.clone()).encode(),
            );
            engine.inject_ax25(&ui.encode()).await;
        }
        clock.advance_secs(6);
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let sent = engine.counters().reqs_sent;
    assert!(sent >= 1, "no REQ went out at all");
    assert!(sent <= 6, "{sent} REQ frames in one minute");

    engine.shutdown().await.unwrap();
}
