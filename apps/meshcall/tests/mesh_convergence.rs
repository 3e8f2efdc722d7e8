//! Several orchestrators wired back to back through an in-memory switchboard.
//! Whatever order presence events and signals arrive in, every pair must end
//! up with exactly one negotiation, offered by the larger id.

use std::collections::HashMap;
use std::sync::Arc;

use meshcall_core::media::MediaBundle;
use meshcall_core::mock::{MockConnector, RecordingSink, RecordingView};
use meshcall_core::negotiation::{NegotiationPhase, Role};
use meshcall_core::peer::LinkState;
use meshcall_core::signaling::{IceCandidate, InboundEvent, SignalEnvelope, SignalKind};
use meshcall_core::{MeshConfig, MeshOrchestrator, ParticipantId};

struct Node {
    id: ParticipantId,
    mesh: MeshOrchestrator,
    connector: Arc<MockConnector>,
    sink: Arc<RecordingSink>,
}

impl Node {
    fn new(id: u64) -> Self {
        let connector = Arc::new(MockConnector::new());
        let sink = Arc::new(RecordingSink::new());
        let mesh = MeshOrchestrator::new(
            ParticipantId::from(id),
            connector.clone(),
            MediaBundle::empty(),
            sink.clone(),
            Arc::new(RecordingView::new()),
            MeshConfig::default(),
        );
        Self {
            id: ParticipantId::from(id),
            mesh,
            connector,
            sink,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Step {
    /// Deliver a presence event to node `at`.
    Presence { at: usize, event: Presence },
    /// Every live link of every node produces a local candidate.
    Gather,
    /// Route signals until the switchboard is quiet.
    Pump,
}

#[derive(Debug, Clone, Copy)]
enum Presence {
    Joined(usize),
    Roster(&'static [usize]),
}

#[derive(Default)]
struct Switchboard {
    offers: HashMap<(ParticipantId, ParticipantId), usize>,
    candidates: u32,
}

impl Switchboard {
    async fn run(&mut self, nodes: &mut [Node], steps: &[Step]) {
        for step in steps {
            match *step {
                Step::Presence { at, event } => {
                    let event = match event {
                        Presence::Joined(other) => InboundEvent::Joined(nodes[other].id.clone()),
                        Presence::Roster(others) => InboundEvent::Roster(
                            others.iter().map(|other| nodes[*other].id.clone()).collect(),
                        ),
                    };
                    nodes[at].mesh.handle_inbound(event).await;
                }
                Step::Gather => {
                    for node in nodes.iter() {
                        for link in node.connector.links() {
                            self.candidates += 1;
                            link.emit_candidate(IceCandidate::new(format!(
                                "candidate:{} 1 udp 1 10.0.0.1 {} typ host",
                                self.candidates,
                                40000 + self.candidates
                            )));
                        }
                    }
                }
                Step::Pump => self.pump(nodes).await,
            }
        }
        self.pump(nodes).await;
    }

    async fn pump(&mut self, nodes: &mut [Node]) {
        loop {
            for node in nodes.iter_mut() {
                node.mesh.drain_link_events().await;
            }
            let mut in_flight = Vec::new();
            for node in nodes.iter() {
                for signal in node.sink.take() {
                    in_flight.push((node.id.clone(), signal));
                }
            }
            if in_flight.is_empty() {
                return;
            }
            for (from, signal) in in_flight {
                if signal.payload.kind() == SignalKind::Offer {
                    *self
                        .offers
                        .entry((from.clone(), signal.to.clone()))
                        .or_default() += 1;
                }
                let target = nodes
                    .iter_mut()
                    .find(|node| node.id == signal.to)
                    .expect("signal to a node outside the room");
                target
                    .mesh
                    .handle_inbound(InboundEvent::Signal(SignalEnvelope::new(from, signal.payload)))
                    .await;
            }
        }
    }
}

fn assert_full_mesh(nodes: &[Node], board: &Switchboard, context: &str) {
    for (i, a) in nodes.iter().enumerate() {
        for b in nodes.iter().skip(i + 1) {
            let (larger, smaller) = if a.id > b.id { (a, b) } else { (b, a) };
            let at_larger = larger
                .mesh
                .registry()
                .get(&smaller.id)
                .unwrap_or_else(|| panic!("{context}: {} has no entry for {}", larger.id, smaller.id));
            let at_smaller = smaller
                .mesh
                .registry()
                .get(&larger.id)
                .unwrap_or_else(|| panic!("{context}: {} has no entry for {}", smaller.id, larger.id));

            assert_eq!(at_larger.role(), Role::Initiator, "{context}");
            assert_eq!(at_smaller.role(), Role::Responder, "{context}");
            assert_eq!(at_larger.phase(), NegotiationPhase::Stable, "{context}");
            assert_eq!(at_smaller.phase(), NegotiationPhase::Stable, "{context}");
            assert_eq!(at_larger.pending_candidates(), 0, "{context}");
            assert_eq!(at_smaller.pending_candidates(), 0, "{context}");

            let forward = board
                .offers
                .get(&(larger.id.clone(), smaller.id.clone()))
                .copied()
                .unwrap_or(0);
            let backward = board
                .offers
                .get(&(smaller.id.clone(), larger.id.clone()))
                .copied()
                .unwrap_or(0);
            assert_eq!((forward, backward), (1, 0), "{context}: offers between {} and {}", larger.id, smaller.id);
        }
        assert_eq!(a.connector.links().len(), nodes.len() - 1, "{context}: one link per peer");
    }
}

/// Node 0 is already in the room; node 1 joins.
fn two_party_orders() -> Vec<Vec<Step>> {
    let joined = Step::Presence {
        at: 0,
        event: Presence::Joined(1),
    };
    let roster = Step::Presence {
        at: 1,
        event: Presence::Roster(&[0]),
    };
    vec![
        vec![joined, roster],
        vec![roster, joined],
        vec![roster, Step::Pump, joined],
        vec![joined, Step::Pump, roster],
        vec![joined, Step::Gather, Step::Pump, roster],
        vec![roster, Step::Gather, Step::Pump, joined, Step::Gather],
        vec![joined, roster, Step::Gather],
    ]
}

#[test_timeout::tokio_timeout_test(20)]
async fn two_participants_converge_in_every_order() {
    for (existing, newcomer) in [(3u64, 5u64), (5, 3)] {
        for (n, steps) in two_party_orders().into_iter().enumerate() {
            let mut nodes = vec![Node::new(existing), Node::new(newcomer)];
            let mut board = Switchboard::default();
            board.run(&mut nodes, &steps).await;
            let context = format!("existing={existing} newcomer={newcomer} order #{n}");
            assert_full_mesh(&nodes, &board, &context);
        }
    }
}

#[test_timeout::tokio_timeout_test(20)]
async fn three_participants_joining_one_by_one() {
    let orders: Vec<Vec<Step>> = vec![
        vec![
            Step::Presence { at: 0, event: Presence::Joined(1) },
            Step::Presence { at: 1, event: Presence::Roster(&[0]) },
            Step::Pump,
            Step::Presence { at: 0, event: Presence::Joined(2) },
            Step::Presence { at: 1, event: Presence::Joined(2) },
            Step::Presence { at: 2, event: Presence::Roster(&[0, 1]) },
        ],
        vec![
            Step::Presence { at: 2, event: Presence::Roster(&[0, 1]) },
            Step::Gather,
            Step::Presence { at: 1, event: Presence::Roster(&[0]) },
            Step::Pump,
            Step::Presence { at: 0, event: Presence::Joined(2) },
            Step::Gather,
            Step::Presence { at: 0, event: Presence::Joined(1) },
            Step::Presence { at: 1, event: Presence::Joined(2) },
        ],
    ];
    for ids in [[1u64, 2, 3], [9, 4, 6]] {
        for (n, steps) in orders.iter().enumerate() {
            let mut nodes: Vec<Node> = ids.iter().map(|id| Node::new(*id)).collect();
            let mut board = Switchboard::default();
            board.run(&mut nodes, steps).await;
            assert_full_mesh(&nodes, &board, &format!("ids={ids:?} order #{n}"));
        }
    }
}

#[test_timeout::tokio_timeout_test(20)]
async fn string_ids_follow_the_same_rule() {
    let mut nodes = vec![Node::new(7), Node::new(8)];
    // Replace node 1 with a string-identified participant.
    nodes[1] = {
        let connector = Arc::new(MockConnector::new());
        let sink = Arc::new(RecordingSink::new());
        let id = ParticipantId::from("guest");
        Node {
            mesh: MeshOrchestrator::new(
                id.clone(),
                connector.clone(),
                MediaBundle::empty(),
                sink.clone(),
                Arc::new(RecordingView::new()),
                MeshConfig::default(),
            ),
            id,
            connector,
            sink,
        }
    };
    let mut board = Switchboard::default();
    board
        .run(
            &mut nodes,
            &[
                Step::Presence { at: 1, event: Presence::Roster(&[0]) },
                Step::Gather,
                Step::Presence { at: 0, event: Presence::Joined(1) },
            ],
        )
        .await;
    assert_full_mesh(&nodes, &board, "numeric vs string");
}

#[test_timeout::tokio_timeout_test(20)]
async fn failure_seen_only_by_the_initiator_renegotiates() {
    let mut nodes = vec![Node::new(3), Node::new(5)];
    let mut board = Switchboard::default();
    board
        .run(
            &mut nodes,
            &[
                Step::Presence { at: 1, event: Presence::Roster(&[0]) },
                Step::Gather,
            ],
        )
        .await;
    assert_full_mesh(&nodes, &board, "before the failure");

    let (smaller, larger) = (nodes[0].id.clone(), nodes[1].id.clone());
    let stale = nodes[1].connector.latest(&smaller).unwrap();
    let responder_link = nodes[0].connector.latest(&larger).unwrap();
    stale.emit_state(LinkState::Failed);
    board.run(&mut nodes, &[Step::Gather]).await;

    assert!(stale.is_closed());
    assert!(responder_link.is_closed(), "responder drops the old connection");
    assert_eq!(board.offers.get(&(larger.clone(), smaller.clone())), Some(&2));
    assert_eq!(nodes[1].mesh.failure_count(&smaller), 1);
    assert_eq!(nodes[0].mesh.failure_count(&larger), 0);
    for (node, peer) in [(&nodes[0], &larger), (&nodes[1], &smaller)] {
        let state = node.mesh.registry().get(peer).unwrap();
        assert_eq!(state.phase(), NegotiationPhase::Stable);
        assert_eq!(state.pending_candidates(), 0);
        assert_eq!(node.connector.links_for(peer).len(), 2);
    }
}
