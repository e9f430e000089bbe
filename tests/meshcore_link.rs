//! MeshCore link against an in-process fake companion radio.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use volley::meshcore::packet::{
    CMD_APP_START, CMD_GET_CONTACTS, CMD_SEND_CHANNEL_TXT_MSG, CMD_SEND_TXT_MSG,
    CMD_SYNC_NEXT_MESSAGE, PUSH_LOG_RX_DATA, PUSH_MSG_WAITING, RESP_CHANNEL_MSG_RECV_V3,
    RESP_CONTACT, RESP_CONTACTS_START, RESP_CONTACT_MSG_RECV_V3, RESP_END_OF_CONTACTS, RESP_ERR,
    RESP_NO_MORE_MESSAGES, RESP_SELF_INFO, RESP_SENT,
};
use volley::meshcore::MeshCoreLink;
use volley::transport::{InboundMessage, Link, ReplyTarget, TransportError};

const ALICE_KEY: [u8; 6] = [0xa1, 0xb2, 0xc3, 0xd4, 0xe5, 0xf6];

fn frame(payload: &[u8]) -> Vec<u8> {
    let mut out = vec![b'>'];
    out.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    out.extend_from_slice(payload);
    out
}

fn micro(deg: f64) -> [u8; 4] {
    ((deg * 1e6).round() as i32).to_le_bytes()
}

fn self_info() -> Vec<u8> {
    let mut p = vec![RESP_SELF_INFO, 1, 20, 22];
    p.extend_from_slice(&[0x42; 32]);
    p.extend_from_slice(&micro(53.5503));
    p.extend_from_slice(&micro(9.9352));
    p.extend_from_slice(&[0; 14]);
    p.extend_from_slice(b"volley-base");
    p
}

fn contact(key_prefix: [u8; 6], name: &str, lat: f64, lon: f64) -> Vec<u8> {
    let mut p = vec![RESP_CONTACT];
    let mut key = [0x11u8; 32];
    key[..6].copy_from_slice(&key_prefix);
    p.extend_from_slice(&key);
    p.extend_from_slice(&[1, 0, 0xff]);
    p.extend_from_slice(&[0; 64]);
    let mut raw_name = [0u8; 32];
    raw_name[..name.len()].copy_from_slice(name.as_bytes());
    p.extend_from_slice(&raw_name);
    p.extend_from_slice(&1_700_000_000u32.to_le_bytes());
    p.extend_from_slice(&micro(lat));
    p.extend_from_slice(&micro(lon));
    p
}

fn channel_msg(channel: u8, path_len: u8, snr_quarters: i8, text: &str) -> Vec<u8> {
    let mut p = vec![RESP_CHANNEL_MSG_RECV_V3, snr_quarters as u8, 0, 0, channel, path_len, 0];
    p.extend_from_slice(&1_714_564_800u32.to_le_bytes());
    p.extend_from_slice(text.as_bytes());
    p
}

fn contact_msg(prefix: [u8; 6], path_len: u8, text: &str) -> Vec<u8> {
    let mut p = vec![RESP_CONTACT_MSG_RECV_V3, 24, 0, 0];
    p.extend_from_slice(&prefix);
    p.extend_from_slice(&[path_len, 0]);
    p.extend_from_slice(&1_714_564_800u32.to_le_bytes());
    p.extend_from_slice(text.as_bytes());
    p
}

fn rx_log(snr_quarters: i8, rssi: i8, path: &[u8]) -> Vec<u8> {
    let mut p = vec![PUSH_LOG_RX_DATA, snr_quarters as u8, rssi as u8, 0x15, path.len() as u8];
    p.extend_from_slice(path);
    p.extend_from_slice(b"payload");
    p
}

/// Scripted companion radio on the far end of a duplex pipe.
struct FakeRadio {
    out: mpsc::UnboundedSender<Vec<u8>>,
    stored: Arc<Mutex<VecDeque<Vec<u8>>>>,
    sends: mpsc::UnboundedReceiver<Vec<u8>>,
    reject_sends: Arc<AtomicBool>,
    hold_sends: Arc<AtomicBool>,
    held: Arc<Mutex<Vec<Vec<u8>>>>,
    tasks: Vec<JoinHandle<()>>,
}

impl FakeRadio {
    fn start(server: DuplexStream) -> Self {
        let (mut rd, mut wr) = tokio::io::split(server);
        let (out, mut out_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let (sends_tx, sends) = mpsc::unbounded_channel();
        let stored = Arc::new(Mutex::new(VecDeque::new()));
        let reject_sends = Arc::new(AtomicBool::new(false));
        let hold_sends = Arc::new(AtomicBool::new(false));
        let held = Arc::new(Mutex::new(Vec::new()));

        let writer = tokio::spawn(async move {
            while let Some(bytes) = out_rx.recv().await {
                if wr.write_all(&bytes).await.is_err() {
                    break;
                }
            }
        });

        let responder = {
            let out = out.clone();
            let stored = stored.clone();
            let reject = reject_sends.clone();
            let hold = hold_sends.clone();
            let held = held.clone();
            tokio::spawn(async move {
                loop {
                    let mut header = [0u8; 3];
                    if rd.read_exact(&mut header).await.is_err() {
                        break;
                    }
                    assert_eq!(header[0], b'<');
                    let len = u16::from_le_bytes([header[1], header[2]]) as usize;
                    let mut cmd = vec![0u8; len];
                    if rd.read_exact(&mut cmd).await.is_err() {
                        break;
                    }
                    let replies: Vec<Vec<u8>> = match cmd[0] {
                        CMD_APP_START => vec![b"boot banner\r\n".to_vec(), frame(&self_info())],
                        CMD_GET_CONTACTS => vec![
                            frame(&[RESP_CONTACTS_START, 1, 0, 0, 0]),
                            frame(&contact(ALICE_KEY, "Alice", 53.8655, 10.6866)),
                            frame(&[RESP_END_OF_CONTACTS]),
                        ],
                        CMD_SYNC_NEXT_MESSAGE => {
                            let next = stored.lock().unwrap().pop_front();
                            vec![frame(&next.unwrap_or_else(|| vec![RESP_NO_MORE_MESSAGES]))]
                        }
                        CMD_SEND_TXT_MSG | CMD_SEND_CHANNEL_TXT_MSG => {
                            let answer = if reject.load(Ordering::SeqCst) {
                                frame(&[RESP_ERR, 2])
                            } else {
                                let mut sent = vec![RESP_SENT, 1];
                                sent.extend_from_slice(&0xdead_beefu32.to_le_bytes());
                                sent.extend_from_slice(&3000u32.to_le_bytes());
                                frame(&sent)
                            };
                            let replies = if hold.load(Ordering::SeqCst) {
                                held.lock().unwrap().push(answer);
                                Vec::new()
                            } else {
                                vec![answer]
                            };
                            // recorded last so a test that saw the send also sees a held answer
                            let _ = sends_tx.send(cmd.clone());
                            replies
                        }
                        _ => vec![frame(&[RESP_ERR, 1])],
                    };
                    for r in replies {
                        let _ = out.send(r);
                    }
                }
            })
        };

        Self {
            out,
            stored,
            sends,
            reject_sends,
            hold_sends,
            held,
            tasks: vec![writer, responder],
        }
    }

    fn store(&self, payload: Vec<u8>) {
        self.stored.lock().unwrap().push_back(payload);
    }

    fn push(&self, payload: &[u8]) {
        self.out.send(frame(payload)).unwrap();
    }

    /// Deliver answers kept back while `hold_sends` was set.
    fn release_held(&self) {
        for answer in self.held.lock().unwrap().drain(..) {
            self.out.send(answer).unwrap();
        }
    }

    fn hang_up(self) {
        for t in &self.tasks {
            t.abort();
        }
    }
}

/// Connected link with the post-connect sync already answered (nothing stored).
async fn connect() -> (MeshCoreLink, FakeRadio) {
    let (client, server) = tokio::io::duplex(4096);
    let radio = FakeRadio::start(server);
    let mut link = MeshCoreLink::establish(client, None, Duration::from_millis(500))
        .await
        .expect("handshake");
    let frame = link.next_frame().await.expect("queued sync");
    assert!(link.process(frame).await.unwrap().is_none());
    (link, radio)
}

async fn next_message(link: &mut MeshCoreLink) -> InboundMessage {
    timeout(Duration::from_secs(2), async {
        loop {
            let frame = link.next_frame().await.expect("link open");
            if let Some(msg) = link.process(frame).await.expect("process") {
                return msg;
            }
        }
    })
    .await
    .expect("message in time")
}

#[tokio::test]
async fn handshake_reports_device() {
    let (link, _radio) = connect().await;
    let info = link.device_info().unwrap();
    assert_eq!(info.name, "volley-base");
    assert_eq!(info.public_key, "42".repeat(32));
    assert_eq!(info.contacts, 1);
    let pos = info.position.unwrap();
    assert!((pos.lat - 53.5503).abs() < 1e-6 && (pos.lon - 9.9352).abs() < 1e-6);
}

#[tokio::test]
async fn stored_messages_are_synced_after_connect() {
    let (client, server) = tokio::io::duplex(4096);
    let radio = FakeRadio::start(server);
    radio.store(channel_msg(0, 2, 26, "Alice: ping"));
    radio.store(channel_msg(0, 0, -8, "no colon here"));
    let mut link = MeshCoreLink::establish(client, None, Duration::from_millis(500))
        .await
        .unwrap();

    let first = next_message(&mut link).await;
    assert_eq!(first.sender, "Alice");
    assert_eq!(first.text, "ping");
    assert_eq!(first.channel, Some(0));
    assert_eq!(first.signal.snr, Some(6.5));
    assert_eq!(first.signal.hops, Some(2));
    assert!(first.signal.route.is_empty());

    let second = next_message(&mut link).await;
    assert_eq!(second.sender, "unknown");
    assert_eq!(second.text, "no colon here");
    assert_eq!(second.signal.snr, Some(-2.0));
}

#[tokio::test]
async fn rx_log_supplies_route_and_rssi() {
    let (mut link, radio) = connect().await;
    radio.push(&rx_log(40, -90, &[0xa1, 0x7f]));
    radio.store(channel_msg(1, 2, 12, "Bob: test"));
    radio.push(&[PUSH_MSG_WAITING]);

    let msg = next_message(&mut link).await;
    assert_eq!(msg.sender_name.as_deref(), Some("Bob"));
    assert_eq!(msg.channel, Some(1));
    assert_eq!(msg.signal.route, vec!["a1", "7f"]);
    assert_eq!(msg.signal.rssi, Some(-90.0));
    assert_eq!(msg.signal.snr, Some(3.0));

    // route belongs to one reception only
    radio.store(channel_msg(1, 0, 12, "Bob: again"));
    radio.push(&[PUSH_MSG_WAITING]);
    let msg = next_message(&mut link).await;
    assert!(msg.signal.route.is_empty());
    assert_eq!(msg.signal.rssi, Some(-90.0));
}

#[tokio::test]
async fn direct_message_resolves_contact() {
    let (mut link, radio) = connect().await;
    radio.store(contact_msg(ALICE_KEY, 0xff, " ping "));
    radio.push(&[PUSH_MSG_WAITING]);

    let msg = next_message(&mut link).await;
    assert!(msg.is_direct());
    assert_eq!(msg.sender, "a1b2c3d4e5f6");
    assert_eq!(msg.display_name(), "Alice");
    assert_eq!(msg.text, "ping");
    assert_eq!(msg.signal.hops, Some(0xff));
    let origin = msg.origin.unwrap();
    assert!((origin.lat - 53.8655).abs() < 1e-6);
}

#[tokio::test]
async fn sends_wait_for_acceptance() {
    let (mut link, mut radio) = connect().await;

    link.send(&ReplyTarget::Channel(0), "@[Alice] pong").await.unwrap();
    let cmd = radio.sends.recv().await.unwrap();
    assert_eq!(cmd[0], CMD_SEND_CHANNEL_TXT_MSG);
    assert_eq!(cmd[2], 0);
    assert!(cmd.ends_with(b"@[Alice] pong"));

    link.send(&ReplyTarget::Direct("a1b2c3d4e5f6".into()), "pong")
        .await
        .unwrap();
    let cmd = radio.sends.recv().await.unwrap();
    assert_eq!(cmd[0], CMD_SEND_TXT_MSG);
    assert_eq!(&cmd[7..13], &ALICE_KEY);
    assert!(cmd.ends_with(b"pong"));

    let err = link
        .send(&ReplyTarget::Direct("ffffffffffff".into()), "pong")
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::UnknownContact(_)));

    radio.reject_sends.store(true, Ordering::SeqCst);
    let err = link.send(&ReplyTarget::Channel(0), "pong").await.unwrap_err();
    assert!(matches!(err, TransportError::Rejected(2)));
    assert!(!err.is_link_fault());
}

#[tokio::test]
async fn late_answer_to_cancelled_send_is_not_reused() {
    let (mut link, mut radio) = connect().await;

    radio.hold_sends.store(true, Ordering::SeqCst);
    let cancelled = timeout(
        Duration::from_millis(50),
        link.send(&ReplyTarget::Channel(0), "first"),
    )
    .await;
    assert!(cancelled.is_err());
    assert!(radio.sends.recv().await.unwrap().ends_with(b"first"));

    // SENT for the cancelled send turns up, then the radio refuses the next one
    radio.hold_sends.store(false, Ordering::SeqCst);
    radio.release_held();
    radio.reject_sends.store(true, Ordering::SeqCst);
    let err = link.send(&ReplyTarget::Channel(0), "second").await.unwrap_err();
    assert!(matches!(err, TransportError::Rejected(2)));

    radio.reject_sends.store(false, Ordering::SeqCst);
    link.send(&ReplyTarget::Channel(0), "third").await.unwrap();
}

#[tokio::test]
async fn late_answer_after_response_timeout_is_discarded() {
    let (mut link, radio) = connect().await;

    radio.hold_sends.store(true, Ordering::SeqCst);
    let err = link.send(&ReplyTarget::Channel(0), "slow").await.unwrap_err();
    assert!(matches!(err, TransportError::Timeout));

    radio.hold_sends.store(false, Ordering::SeqCst);
    radio.release_held();
    radio.reject_sends.store(true, Ordering::SeqCst);
    let err = link.send(&ReplyTarget::Channel(0), "next").await.unwrap_err();
    assert!(matches!(err, TransportError::Rejected(2)));
}

#[tokio::test]
async fn silent_radio_times_out_handshake() {
    let (client, _server) = tokio::io::duplex(4096);
    let err = MeshCoreLink::establish(client, None, Duration::from_millis(100))
        .await
        .err()
        .expect("no handshake");
    assert!(matches!(err, TransportError::Timeout));
}

#[tokio::test]
async fn hang_up_ends_the_frame_stream() {
    let (mut link, radio) = connect().await;
    radio.hang_up();
    let end = timeout(Duration::from_secs(2), link.next_frame())
        .await
        .expect("stream ends");
    assert!(end.is_none());
    link.close().await;
}
