//! End-to-end synchronization: a wave server wired to the client frontend,
//! exercised the way clients drive it.

use std::sync::{Arc, Mutex};

use smartstring::alias::String as SmartString;

use swell::delta::WaveletDelta;
use swell::docop::{DocOpBuilder, DocumentSchema, NoSchemaConstraints, PermittedChars};
use swell::frontend::{
    ClientFrontend, ClientFrontendImpl, CommittedWaveletSnapshot, OpenListener, WaveletInfo,
    WaveletProvider,
};
use swell::delta::DeltaSequence;
use swell::server::{Clock, WaveServer};
use swell::version::{HashedVersion, HashedVersionFactory};
use swell::wave::{IdFilter, ParticipantId, WaveId, WaveletId, WaveletName, WaveletOp};
use swell::Timestamp;

struct FixedClock;

impl Clock for FixedClock {
    fn now_millis(&self) -> Timestamp {
        1_700_000_000_000
    }
}

#[derive(Debug)]
struct Update {
    wavelet_name: WaveletName,
    has_snapshot: bool,
    delta_count: usize,
    delta_start: Option<u64>,
    committed: Option<u64>,
    marker: bool,
    channel_id: Option<String>,
}

#[derive(Default)]
struct RecordingListener {
    updates: Mutex<Vec<Update>>,
    failures: Mutex<Vec<String>>,
}

impl RecordingListener {
    fn updates(&self) -> std::sync::MutexGuard<'_, Vec<Update>> {
        self.updates.lock().unwrap()
    }
}

impl OpenListener for RecordingListener {
    fn on_update(
        &self,
        wavelet_name: &WaveletName,
        snapshot: Option<&CommittedWaveletSnapshot>,
        deltas: &DeltaSequence,
        committed_version: Option<&HashedVersion>,
        marker: bool,
        channel_id: Option<&str>,
    ) {
        self.updates.lock().unwrap().push(Update {
            wavelet_name: wavelet_name.clone(),
            has_snapshot: snapshot.is_some(),
            delta_count: deltas.len(),
            delta_start: (!deltas.is_empty()).then(|| deltas.start_version()),
            committed: committed_version.map(|v| v.version),
            marker,
            channel_id: channel_id.map(str::to_string),
        });
    }

    fn on_failure(&self, error: &str) {
        self.failures.lock().unwrap().push(error.to_string());
    }
}

fn wiring(schema: Box<dyn DocumentSchema + Send + Sync>) -> (Arc<WaveServer>, Arc<ClientFrontendImpl>) {
    let server = Arc::new(WaveServer::new(schema, Box::new(FixedClock)));
    let provider: Arc<dyn WaveletProvider> = server.clone();
    let info = Arc::new(WaveletInfo::new(HashedVersionFactory::new(), provider.clone()));
    let frontend = Arc::new(ClientFrontendImpl::new(provider, info));
    server.subscribe(frontend.clone());
    (server, frontend)
}

fn alice() -> ParticipantId {
    ParticipantId::new("alice@example.com").unwrap()
}

fn bob() -> ParticipantId {
    ParticipantId::new("bob@example.com").unwrap()
}

fn wave_id() -> WaveId {
    WaveId::new("example.com", "w+test").unwrap()
}

fn conv_name() -> WaveletName {
    WaveletName::new(wave_id(), WaveletId::new("example.com", "conv+root").unwrap())
}

/// Opens a view and returns (listener, channel id).
fn open(
    frontend: &ClientFrontendImpl,
    user: &ParticipantId,
    known: &[(WaveletId, HashedVersion)],
) -> (Arc<RecordingListener>, String) {
    let listener = Arc::new(RecordingListener::default());
    frontend.open_request(user, &wave_id(), &IdFilter::all(), known, listener.clone());
    let channel = {
        let updates = listener.updates();
        assert!(!updates.is_empty(), "open produced no messages");
        // The channel id arrives in the very first message, and only there.
        let channel = updates[0].channel_id.clone().expect("first message must carry channel id");
        for later in &updates[1..] {
            assert!(later.channel_id.is_none(), "channel id repeated: {:?}", later);
        }
        assert!(updates.last().unwrap().marker, "open must end with the caught-up marker");
        channel
    };
    (listener, channel)
}

#[test]
fn open_empty_wave_yields_channel_and_marker() {
    let (_server, frontend) = wiring(Box::new(NoSchemaConstraints));
    let (listener, _channel) = open(&frontend, &alice(), &[]);
    let updates = listener.updates();
    // Nothing visible: one channel-only message plus the marker.
    assert_eq!(updates.len(), 2);
    assert_eq!(updates[0].delta_count, 0);
    assert!(!updates[0].marker);
    assert!(updates[1].marker);
}

#[test]
fn submit_creates_wavelet_and_echoes_through_the_stream() {
    let (_server, frontend) = wiring(Box::new(NoSchemaConstraints));
    let (listener, channel) = open(&frontend, &alice(), &[]);

    let create = WaveletDelta::new(
        alice(),
        HashedVersion::unsigned(0),
        vec![
            WaveletOp::AddParticipant(alice()),
            WaveletOp::Blip {
                blip_id: "b+1".into(),
                op: DocOpBuilder::new().characters("hello").build().unwrap(),
            },
        ],
    );
    let result = frontend.submit_request(&alice(), &conv_name(), create, &channel).unwrap();
    assert_eq!(result.operations_applied, 2);
    assert_eq!(result.hashed_version_after_application.version, 2);

    // The accepted delta comes back on the open stream (flushed after the
    // submit response).
    let updates = listener.updates();
    let echoed = updates
        .iter()
        .find(|u| u.wavelet_name == conv_name() && u.delta_count == 1)
        .expect("own delta echoed on the stream");
    assert_eq!(echoed.delta_start, Some(0));
}

#[test]
fn author_must_match_logged_in_user() {
    let (_server, frontend) = wiring(Box::new(NoSchemaConstraints));
    let (_listener, channel) = open(&frontend, &alice(), &[]);
    let delta = WaveletDelta::new(
        bob(),
        HashedVersion::unsigned(0),
        vec![WaveletOp::AddParticipant(bob())],
    );
    let err = frontend.submit_request(&alice(), &conv_name(), delta, &channel).unwrap_err();
    assert!(err.contains("must match"), "{}", err);
}

#[test]
fn stale_delta_is_rejected_not_merged() {
    let (_server, frontend) = wiring(Box::new(NoSchemaConstraints));
    let (_listener, channel) = open(&frontend, &alice(), &[]);

    let create = WaveletDelta::new(
        alice(),
        HashedVersion::unsigned(0),
        vec![WaveletOp::AddParticipant(alice())],
    );
    let v1 = frontend
        .submit_request(&alice(), &conv_name(), create, &channel)
        .unwrap()
        .hashed_version_after_application;

    let edit = WaveletDelta::new(alice(), v1.clone(), vec![WaveletOp::NoOp]);
    frontend.submit_request(&alice(), &conv_name(), edit.clone(), &channel).unwrap();

    // Submitting the same delta again targets a superseded version.
    let err = frontend.submit_request(&alice(), &conv_name(), edit, &channel).unwrap_err();
    assert!(err.contains("targets version"), "{}", err);
}

#[test]
fn late_joiner_gets_snapshot_then_lagging_client_gets_deltas() {
    let (server, frontend) = wiring(Box::new(NoSchemaConstraints));
    let (_alice_listener, channel) = open(&frontend, &alice(), &[]);

    // Alice creates the wavelet, adds bob, and writes some text.
    let create = WaveletDelta::new(
        alice(),
        HashedVersion::unsigned(0),
        vec![WaveletOp::AddParticipant(alice()), WaveletOp::AddParticipant(bob())],
    );
    let v2 = frontend
        .submit_request(&alice(), &conv_name(), create, &channel)
        .unwrap()
        .hashed_version_after_application;

    let edit = WaveletDelta::new(
        alice(),
        v2.clone(),
        vec![WaveletOp::Blip {
            blip_id: "b+1".into(),
            op: DocOpBuilder::new().characters("hi").build().unwrap(),
        }],
    );
    let v3 = frontend
        .submit_request(&alice(), &conv_name(), edit, &channel)
        .unwrap()
        .hashed_version_after_application;

    // Bob opens with no known state: he gets a full snapshot.
    let (bob_listener, _) = open(&frontend, &bob(), &[]);
    {
        let updates = bob_listener.updates();
        let snap = updates
            .iter()
            .find(|u| u.wavelet_name == conv_name())
            .expect("bob sees the wavelet");
        assert!(snap.has_snapshot);
        assert_eq!(snap.committed, Some(3));
    }

    // Bob reopens knowing version 2: the gap is bridged with the minimal
    // contiguous delta run, no snapshot.
    let conv_id = WaveletId::new("example.com", "conv+root").unwrap();
    let (bob_lagging, _) = open(&frontend, &bob(), &[(conv_id.clone(), v2.clone())]);
    {
        let updates = bob_lagging.updates();
        let catch_up = updates
            .iter()
            .find(|u| u.wavelet_name == conv_name())
            .expect("bob sees the wavelet");
        assert!(!catch_up.has_snapshot);
        assert_eq!(catch_up.delta_count, 1);
        assert_eq!(catch_up.delta_start, Some(2));
        assert_eq!(catch_up.committed, Some(3));
    }

    // A client already at the head just gets the committed-version ack.
    let (bob_current, _) = open(&frontend, &bob(), &[(conv_id, v3.clone())]);
    {
        let updates = bob_current.updates();
        let ack = updates
            .iter()
            .find(|u| u.wavelet_name == conv_name())
            .expect("bob sees the wavelet");
        assert!(!ack.has_snapshot);
        assert_eq!(ack.delta_count, 0);
        assert_eq!(ack.committed, Some(3));
    }

    // Sanity: the server snapshot agrees with everything the stream said.
    let snapshot = server.snapshot(&conv_name()).unwrap().unwrap();
    assert_eq!(snapshot.snapshot.version(), 3);
    assert_eq!(snapshot.snapshot.blip("b+1").unwrap().content.to_xml_string(), "hi");
}

#[test]
fn removed_participant_sees_the_delta_that_removed_them() {
    let (_server, frontend) = wiring(Box::new(NoSchemaConstraints));
    let (_alice_listener, channel) = open(&frontend, &alice(), &[]);

    let create = WaveletDelta::new(
        alice(),
        HashedVersion::unsigned(0),
        vec![WaveletOp::AddParticipant(alice()), WaveletOp::AddParticipant(bob())],
    );
    let v2 = frontend
        .submit_request(&alice(), &conv_name(), create, &channel)
        .unwrap()
        .hashed_version_after_application;

    let (bob_listener, _) = open(&frontend, &bob(), &[]);
    let before = bob_listener.updates().len();

    let remove = WaveletDelta::new(alice(), v2, vec![WaveletOp::RemoveParticipant(bob())]);
    frontend.submit_request(&alice(), &conv_name(), remove, &channel).unwrap();

    // Bob still hears about the delta that removed him.
    let updates = bob_listener.updates();
    assert!(
        updates[before..].iter().any(|u| u.delta_count == 1 && u.delta_start == Some(2)),
        "removal delta not delivered: {:?}",
        &updates[before..]
    );
}

/// A conversation-shaped schema: a body must lead with a line.
struct ConversationSchema;

impl DocumentSchema for ConversationSchema {
    fn permits_child(&self, parent: Option<&str>, child: &str) -> bool {
        matches!((parent, child), (None, "body") | (Some("body"), "line"))
    }
    fn permits_attribute(&self, tag: &str, key: &str, _value: &str) -> bool {
        tag == "line" && key == "id"
    }
    fn permitted_chars(&self, tag: Option<&str>) -> PermittedChars {
        match tag {
            Some("body") => PermittedChars::BlipText,
            _ => PermittedChars::None,
        }
    }
    fn required_initial_children(&self, tag: Option<&str>) -> Vec<SmartString> {
        match tag {
            Some("body") => vec!["line".into()],
            _ => Vec::new(),
        }
    }
}

#[test]
fn schema_gates_blip_content_at_the_server() {
    let (_server, frontend) = wiring(Box::new(ConversationSchema));
    let (_listener, channel) = open(&frontend, &alice(), &[]);

    // Seeding body without the required leading line is rejected whole.
    let bad = WaveletDelta::new(
        alice(),
        HashedVersion::unsigned(0),
        vec![
            WaveletOp::AddParticipant(alice()),
            WaveletOp::Blip {
                blip_id: "b+1".into(),
                op: DocOpBuilder::new()
                    .element_start("body", Default::default())
                    .characters("hi")
                    .element_end()
                    .build()
                    .unwrap(),
            },
        ],
    );
    let err = frontend.submit_request(&alice(), &conv_name(), bad, &channel).unwrap_err();
    assert!(err.contains("child element required"), "{}", err);

    // Correctly seeded content is accepted.
    let good = WaveletDelta::new(
        alice(),
        HashedVersion::unsigned(0),
        vec![
            WaveletOp::AddParticipant(alice()),
            WaveletOp::Blip {
                blip_id: "b+1".into(),
                op: DocOpBuilder::new()
                    .element_start("body", Default::default())
                    .element_start("line", Default::default())
                    .element_end()
                    .characters("hi")
                    .element_end()
                    .build()
                    .unwrap(),
            },
        ],
    );
    let result = frontend.submit_request(&alice(), &conv_name(), good, &channel).unwrap();
    assert_eq!(result.hashed_version_after_application.version, 2);
}
