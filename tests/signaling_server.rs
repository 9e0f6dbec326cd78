#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use roomcall::call::{CallKind, CallStateMachine, ConnectionState, ExchangeKind};
use roomcall::config::CallConfig;
use roomcall::log::NoopLogSink;
use roomcall::signaling::SignalingServer;
use roomcall::signaling::protocol::{Msg, read_msg, write_msg};

fn start_server() -> SocketAddr {
    let machine = Arc::new(CallStateMachine::new(CallConfig::default()));
    let server = SignalingServer::bind("127.0.0.1:0", machine, Arc::new(NoopLogSink)).unwrap();
    let addr = server.local_addr().unwrap();
    thread::spawn(move || server.run());
    addr
}

struct Client {
    stream: TcpStream,
}

impl Client {
    fn connect(addr: SocketAddr, participant_id: &str) -> Self {
        let stream = TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let mut client = Self { stream };
        client.send(Msg::Identify {
            participant_id: participant_id.into(),
        });
        assert!(matches!(client.recv(), Msg::IdentifyOk { .. }));
        client
    }

    fn send(&mut self, msg: Msg) {
        write_msg(&mut self.stream, &msg).unwrap();
    }

    fn recv(&mut self) -> Msg {
        read_msg(&mut self.stream).unwrap()
    }

    /// Reads until `pred` matches, returning the matching message.
    fn recv_until(&mut self, pred: impl Fn(&Msg) -> bool) -> Msg {
        loop {
            let msg = self.recv();
            if pred(&msg) {
                return msg;
            }
        }
    }
}

fn connected(who: &'static str) -> impl Fn(&Msg) -> bool {
    move |m: &Msg| {
        matches!(
            m,
            Msg::StateChanged { participant_id, state: ConnectionState::Connected, .. }
                if participant_id == who
        )
    }
}

#[test]
fn two_participants_negotiate_over_tcp() {
    let addr = start_server();
    let mut alice = Client::connect(addr, "alice");
    let mut bob = Client::connect(addr, "bob");

    alice.send(Msg::AllocateCall);
    let Msg::CallAllocated { call_id } = alice.recv() else {
        panic!("expected CallAllocated");
    };

    alice.send(Msg::Join {
        call_id: call_id.clone(),
        kind: CallKind::OneToOne,
    });
    alice.recv_until(connected("alice"));

    bob.send(Msg::Join {
        call_id: call_id.clone(),
        kind: CallKind::OneToOne,
    });
    let pending = bob.recv_until(|m| matches!(m, Msg::JoinPending { .. }));
    assert_eq!(
        pending,
        Msg::JoinPending {
            call_id: call_id.clone(),
            state: ConnectionState::Joining,
            peers: vec!["alice".into()],
        }
    );

    bob.send(Msg::Negotiate {
        call_id: call_id.clone(),
        to: "alice".into(),
        kind: ExchangeKind::Offer,
        in_reply_to: 0,
        payload: Bytes::from_static(b"bob-offer"),
    });
    let offer = alice.recv_until(|m| matches!(m, Msg::Negotiation { .. }));
    let Msg::Negotiation {
        exchange_id,
        from,
        payload,
        ..
    } = offer
    else {
        unreachable!()
    };
    assert_eq!(from, "bob");
    assert_eq!(payload, Bytes::from_static(b"bob-offer"));

    alice.send(Msg::Negotiate {
        call_id: call_id.clone(),
        to: "bob".into(),
        kind: ExchangeKind::Answer,
        in_reply_to: exchange_id,
        payload: Bytes::from_static(b"alice-answer"),
    });
    bob.recv_until(|m| matches!(m, Msg::Negotiation { kind: ExchangeKind::Answer, .. }));
    bob.recv_until(connected("bob"));
    alice.recv_until(connected("bob"));

    bob.send(Msg::Leave {
        call_id: call_id.clone(),
    });
    alice.recv_until(|m| {
        matches!(
            m,
            Msg::StateChanged { participant_id, state: ConnectionState::Left, .. }
                if participant_id == "bob"
        )
    });
}

#[test]
fn unidentified_connection_gets_an_error() {
    let addr = start_server();
    let mut stream = TcpStream::connect(addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();

    write_msg(&mut stream, &Msg::Ping { nonce: 9 }).unwrap();
    assert_eq!(read_msg(&mut stream).unwrap(), Msg::Pong { nonce: 9 });

    write_msg(
        &mut stream,
        &Msg::Heartbeat {
            call_id: "call-x".into(),
        },
    )
    .unwrap();
    assert!(matches!(
        read_msg(&mut stream).unwrap(),
        Msg::Error { code: 2, .. }
    ));
}
