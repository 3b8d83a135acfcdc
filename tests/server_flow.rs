//! End-to-end scenarios: a reactor driven directly with parsed frames,
//! observing the rendered lines each fake connection would receive.

use cometd::config::Config;
use cometd::hooks::{keys, HookPayload};
use cometd::reactor::{Event, ServerCore};
use cometd::state::ClientId;
use comet_proto::{MsgBuf, Numeric};
use tokio::sync::mpsc;

struct TestConn {
    id: ClientId,
    rx: mpsc::Receiver<String>,
}

impl TestConn {
    /// Everything queued for this connection so far.
    fn drain(&mut self) -> Vec<String> {
        let mut lines = Vec::new();
        while let Ok(line) = self.rx.try_recv() {
            lines.push(line);
        }
        lines
    }

    fn drain_joined(&mut self) -> String {
        self.drain().join("")
    }
}

fn server() -> ServerCore {
    let (mut core, _events) = ServerCore::new(Config::for_testing());
    // Scenario scripts shouldn't trip receive-flood accounting.
    core.state.config.ratelimit.messages = 10_000;
    core
}

fn connect(core: &mut ServerCore) -> TestConn {
    let (tx, rx) = mpsc::channel(512);
    let id = core.attach_local_client(tx, None);
    TestConn { id, rx }
}

fn send(core: &mut ServerCore, conn: &TestConn, line: &str) {
    let msg = MsgBuf::parse(line).expect("test scripts send valid frames");
    core.handle_event(Event::Frame {
        client: conn.id,
        msg,
    });
    core.drain_deferred();
}

fn register(core: &mut ServerCore, conn: &mut TestConn, nick: &str) {
    send(core, conn, &format!("NICK {nick}"));
    send(core, conn, &format!("USER {nick} 0 * :Test User {nick}"));
    conn.drain();
}

fn set_host(core: &mut ServerCore, conn: &TestConn, host: &str) {
    core.state.clients.get_mut(conn.id).unwrap().host = host.to_string();
}

#[tokio::test]
async fn capability_negotiation_to_registration() {
    let mut core = server();
    let mut alice = connect(&mut core);

    send(&mut core, &alice, "CAP LS 302");
    let ls = alice.drain_joined();
    assert!(ls.contains("CAP * LS"));
    assert!(ls.contains("server-time"));
    assert!(ls.contains("draft/chathistory"));
    assert!(ls.contains("extended-monitor"));

    send(&mut core, &alice, "CAP REQ :server-time");
    let ack = alice.drain_joined();
    assert!(ack.contains("CAP * ACK"), "got: {ack}");
    assert!(ack.contains("server-time"));

    // Registration is suspended until CAP END.
    send(&mut core, &alice, "NICK alice");
    send(&mut core, &alice, "USER a 0 * :Alice");
    assert!(!alice.drain_joined().contains(" 001 "));

    send(&mut core, &alice, "CAP END");
    let burst = alice.drain();
    let joined = burst.join("");
    for numeric in ["001", "002", "003", "004", "005"] {
        assert!(joined.contains(&format!(" {numeric} ")), "missing {numeric}");
    }
    // Post-negotiation, every line to this client carries server-time.
    assert!(burst.iter().all(|l| l.starts_with("@time=")), "{burst:?}");

    send(&mut core, &alice, "PING :token");
    let pong = alice.drain_joined();
    assert!(pong.starts_with("@time="));
    assert!(pong.contains("PONG"));
}

#[tokio::test]
async fn join_creates_channel_with_op_and_names() {
    let mut core = server();
    let mut alice = connect(&mut core);
    register(&mut core, &mut alice, "alice");
    set_host(&mut core, &alice, "h");
    core.state.clients.get_mut(alice.id).unwrap().user = "a".into();

    send(&mut core, &alice, "JOIN #foo");
    let lines = alice.drain();

    assert!(lines[0].contains(":alice!a@h JOIN #foo"));
    let joined = lines.join("");
    assert!(!joined.contains(" 332 "), "no topic numeric for a fresh channel");
    assert!(joined.contains(" 353 alice = #foo"));
    assert!(joined.contains("@alice"), "creator listed with op sigil");
    assert!(joined.contains(" 366 alice #foo"));

    let chan = core.state.channels.by_name("#foo").unwrap();
    let channel = core.state.channels.get(chan).unwrap();
    assert!(channel.member(alice.id).unwrap().status.op);
    assert!(channel.created_at > 0);
}

#[tokio::test]
async fn ban_enforcement_with_exempt() {
    let mut core = server();
    let mut alice = connect(&mut core);
    register(&mut core, &mut alice, "alice");
    send(&mut core, &alice, "JOIN #foo");
    send(&mut core, &alice, "MODE #foo +b *!*@evil.example");
    send(&mut core, &alice, "MODE #foo +e *!bob@*");
    alice.drain();

    let mut bob = connect(&mut core);
    register(&mut core, &mut bob, "bob");
    core.state.clients.get_mut(bob.id).unwrap().user = "bob".into();
    set_host(&mut core, &bob, "evil.example");
    send(&mut core, &bob, "JOIN #foo");
    let lines = bob.drain_joined();
    assert!(lines.contains("JOIN #foo"), "exempt overrides ban: {lines}");

    let mut carol = connect(&mut core);
    register(&mut core, &mut carol, "carol");
    core.state.clients.get_mut(carol.id).unwrap().user = "c".into();
    set_host(&mut core, &carol, "evil.example");
    send(&mut core, &carol, "JOIN #foo");
    let lines = carol.drain_joined();
    assert!(
        lines.contains(" 474 carol #foo :Cannot join channel (+b)"),
        "got: {lines}"
    );
    let chan = core.state.channels.by_name("#foo").unwrap();
    assert!(!core.state.channels.get(chan).unwrap().is_member(carol.id));
}

#[tokio::test]
async fn message_tag_gating_per_recipient() {
    let mut core = server();
    let mut sender = connect(&mut core);
    register(&mut core, &mut sender, "sender");
    send(&mut core, &sender, "JOIN #foo");

    let mut u1 = connect(&mut core);
    send(&mut core, &u1, "CAP REQ :server-time message-tags");
    register(&mut core, &mut u1, "u1");
    send(&mut core, &u1, "CAP END");
    u1.drain();
    send(&mut core, &u1, "JOIN #foo");

    let mut u2 = connect(&mut core);
    register(&mut core, &mut u2, "u2");
    send(&mut core, &u2, "JOIN #foo");

    u1.drain();
    u2.drain();
    send(&mut core, &sender, "PRIVMSG #foo :hi");

    let rich = u1.drain_joined();
    assert!(rich.starts_with('@'));
    assert!(rich.contains("msgid="));
    assert!(rich.contains("time="));
    assert!(rich.contains("PRIVMSG #foo"));

    let plain = u2.drain_joined();
    assert!(plain.starts_with(":sender!"), "got: {plain}");
    assert!(!plain.contains("msgid="));
    assert!(!plain.contains("time="));
}

#[tokio::test]
async fn hook_veto_blocks_channel_message()
{
    let mut core = server();
    core.hooks.register(
        keys::PRIVMSG_CHANNEL,
        Box::new(|state, payload| {
            if let HookPayload::PrivmsgChannel { channel, .. } = payload {
                let name = state
                    .channels
                    .get(*channel)
                    .map(|c| c.name.clone())
                    .unwrap_or_default();
                if name.starts_with("#quiet") {
                    payload.reject(Numeric::ERR_CANNOTSENDTOCHAN.code());
                }
            }
        }),
    );

    let mut alice = connect(&mut core);
    register(&mut core, &mut alice, "alice");
    let mut bob = connect(&mut core);
    register(&mut core, &mut bob, "bob");
    send(&mut core, &alice, "JOIN #quiet");
    send(&mut core, &bob, "JOIN #quiet");
    alice.drain();
    bob.drain();

    send(&mut core, &alice, "PRIVMSG #quiet :hello");
    let reply = alice.drain_joined();
    assert!(reply.contains(" 404 alice #quiet"), "got: {reply}");
    assert!(bob.drain_joined().is_empty(), "no fan-out after veto");
}

#[tokio::test]
async fn labeled_response_wraps_command_output() {
    let mut core = server();
    let mut alice = connect(&mut core);
    send(
        &mut core,
        &alice,
        "CAP REQ :labeled-response batch server-time",
    );
    register(&mut core, &mut alice, "alice");
    send(&mut core, &alice, "CAP END");
    alice.drain();

    // Single reply: the label rides the reply itself.
    send(&mut core, &alice, "@label=abc PING :x");
    let pong = alice.drain_joined();
    assert!(pong.contains("label=abc"), "got: {pong}");
    assert!(pong.contains("PONG"));
    assert!(!pong.contains("BATCH"));

    // Multiple replies (324 + 329): wrapped in a labeled-response batch.
    send(&mut core, &alice, "JOIN #lab");
    alice.drain();
    send(&mut core, &alice, "@label=xyz MODE #lab");
    let lines = alice.drain();
    assert!(lines[0].contains("BATCH +"), "got: {lines:?}");
    assert!(lines[0].contains("label=xyz"));
    assert!(lines[0].contains("labeled-response"));
    assert!(lines.last().unwrap().contains("BATCH -"));
    assert!(lines[1..lines.len() - 1]
        .iter()
        .all(|l| l.contains("batch=")));
}

#[tokio::test]
async fn unknown_command_and_arity_errors() {
    let mut core = server();
    let mut alice = connect(&mut core);
    register(&mut core, &mut alice, "alice");

    send(&mut core, &alice, "FROBNICATE x");
    assert!(alice.drain_joined().contains(" 421 alice FROBNICATE"));

    send(&mut core, &alice, "KICK #foo");
    assert!(alice.drain_joined().contains(" 461 alice KICK"));
}

#[tokio::test]
async fn commands_gated_before_registration() {
    let mut core = server();
    let mut alice = connect(&mut core);

    send(&mut core, &alice, "PRIVMSG bob :hi");
    assert!(alice.drain_joined().contains(" 451 "));

    register(&mut core, &mut alice, "alice");
    send(&mut core, &alice, "USER again 0 * :again");
    assert!(alice.drain_joined().contains(" 462 "));
}

#[tokio::test]
async fn nick_collision_and_change_propagation() {
    let mut core = server();
    let mut alice = connect(&mut core);
    register(&mut core, &mut alice, "alice");
    let mut bob = connect(&mut core);
    register(&mut core, &mut bob, "bob");

    // Folded collision: BOB == bob.
    send(&mut core, &alice, "NICK BOB");
    assert!(alice.drain_joined().contains(" 433 alice BOB"));

    send(&mut core, &alice, "JOIN #c");
    send(&mut core, &bob, "JOIN #c");
    alice.drain();
    bob.drain();

    send(&mut core, &alice, "NICK alicia");
    let seen_by_bob = bob.drain_joined();
    assert!(seen_by_bob.contains("NICK alicia"), "got: {seen_by_bob}");
    assert_eq!(core.state.clients.by_nick("alicia"), Some(alice.id));
    assert_eq!(core.state.clients.by_nick("alice"), None);
}

#[tokio::test]
async fn quit_broadcasts_and_destroys_empty_channel() {
    let mut core = server();
    let mut alice = connect(&mut core);
    register(&mut core, &mut alice, "alice");
    let mut bob = connect(&mut core);
    register(&mut core, &mut bob, "bob");
    send(&mut core, &alice, "JOIN #c");
    send(&mut core, &bob, "JOIN #c");
    send(&mut core, &bob, "PART #c");
    bob.drain();
    alice.drain();

    send(&mut core, &alice, "QUIT :gone fishing");
    assert!(core.state.clients.get(alice.id).is_none());
    assert!(
        core.state.channels.by_name("#c").is_none(),
        "empty channel destroyed on quit"
    );
    // Final drain carries the ERROR line.
    let last = alice.drain_joined();
    assert!(last.contains("ERROR :Closing Link"), "got: {last}");
    assert!(last.contains("gone fishing"));
}

#[tokio::test]
async fn topic_flow_on_join() {
    let mut core = server();
    let mut alice = connect(&mut core);
    register(&mut core, &mut alice, "alice");
    send(&mut core, &alice, "JOIN #t");
    send(&mut core, &alice, "TOPIC #t :the topic");
    alice.drain();

    let mut bob = connect(&mut core);
    register(&mut core, &mut bob, "bob");
    send(&mut core, &bob, "JOIN #t");
    let lines = bob.drain_joined();
    assert!(lines.contains(" 332 bob #t :the topic"), "got: {lines}");
    assert!(lines.contains(" 333 bob #t alice!"), "got: {lines}");
}

#[tokio::test]
async fn invite_past_invite_only() {
    let mut core = server();
    let mut alice = connect(&mut core);
    register(&mut core, &mut alice, "alice");
    let mut bob = connect(&mut core);
    register(&mut core, &mut bob, "bob");

    send(&mut core, &alice, "JOIN #i");
    send(&mut core, &alice, "MODE #i +i");
    alice.drain();

    send(&mut core, &bob, "JOIN #i");
    assert!(bob.drain_joined().contains(" 473 bob #i"));

    send(&mut core, &alice, "INVITE bob #i");
    assert!(alice.drain_joined().contains(" 341 alice bob #i"));
    assert!(bob.drain_joined().contains("INVITE bob #i"));

    send(&mut core, &bob, "JOIN #i");
    assert!(bob.drain_joined().contains("JOIN #i"));
}

#[tokio::test]
async fn knock_reaches_operators() {
    let mut core = server();
    let mut alice = connect(&mut core);
    register(&mut core, &mut alice, "alice");
    let mut bob = connect(&mut core);
    register(&mut core, &mut bob, "bob");

    send(&mut core, &alice, "JOIN #k");
    alice.drain();

    // Open channel: knock is rejected with 713.
    send(&mut core, &bob, "KNOCK #k");
    assert!(bob.drain_joined().contains(" 713 bob #k"));

    send(&mut core, &alice, "MODE #k +i");
    alice.drain();
    send(&mut core, &bob, "KNOCK #k");
    assert!(bob.drain_joined().contains(" 711 bob #k"));
    assert!(alice.drain_joined().contains(" 710 alice #k bob!"));

    // Repeat knocks trip the per-user delay.
    send(&mut core, &bob, "KNOCK #k");
    let lines = bob.drain_joined();
    assert!(lines.contains(" 712 bob #k"), "got: {lines}");
    assert!(lines.contains("(user)"));

    // A fresh knocker is still held off by the channel shield.
    let mut carol = connect(&mut core);
    register(&mut core, &mut carol, "carol");
    send(&mut core, &carol, "KNOCK #k");
    let lines = carol.drain_joined();
    assert!(lines.contains(" 712 carol #k"), "got: {lines}");
    assert!(lines.contains("(channel)"));
    // The shield did not deliver anything to the operators.
    assert!(alice.drain_joined().is_empty());
}

#[tokio::test]
async fn ping_timeout_disconnects_idle_client() {
    let mut core = server();
    let mut alice = connect(&mut core);
    register(&mut core, &mut alice, "alice");
    alice.drain();

    let now = cometd::state::unix_now();
    let ping_after = core.state.config.idle_timeouts.ping as i64;
    let timeout_after = ping_after + core.state.config.idle_timeouts.timeout as i64;

    // Idle past the ping threshold: server PINGs once.
    core.tick_at(now + ping_after + 1);
    core.drain_deferred();
    assert!(alice.drain_joined().contains("PING"));
    assert!(core.state.clients.get(alice.id).is_some());

    // Still silent past the timeout: disconnected.
    core.tick_at(now + timeout_after + 1);
    core.drain_deferred();
    assert!(core.state.clients.get(alice.id).is_none());
    assert!(alice.drain_joined().contains("Ping timeout"));
}

#[tokio::test]
async fn away_is_reported_to_senders() {
    let mut core = server();
    let mut alice = connect(&mut core);
    register(&mut core, &mut alice, "alice");
    let mut bob = connect(&mut core);
    register(&mut core, &mut bob, "bob");

    send(&mut core, &bob, "AWAY :out to lunch");
    assert!(bob.drain_joined().contains(" 306 "));

    send(&mut core, &alice, "PRIVMSG bob :ping?");
    assert!(alice
        .drain_joined()
        .contains(" 301 alice bob :out to lunch"));

    send(&mut core, &bob, "AWAY");
    assert!(bob.drain_joined().contains(" 305 "));
}

#[tokio::test]
async fn oper_grant_and_mode_query() {
    let mut core = server();
    let mut alice = connect(&mut core);
    register(&mut core, &mut alice, "alice");

    send(&mut core, &alice, "OPER admin wrongpass");
    assert!(alice.drain_joined().contains(" 464 "));

    send(&mut core, &alice, "OPER admin hunter2");
    let lines = alice.drain_joined();
    assert!(lines.contains(" 381 "));
    assert!(lines.contains("MODE alice +o"));
    assert!(core.state.clients.get(alice.id).unwrap().oper);

    send(&mut core, &alice, "MODE alice");
    assert!(alice.drain_joined().contains(" 221 alice +o"));
}

#[tokio::test]
async fn bot_module_marks_whois() {
    let mut core = server();
    let mut alice = connect(&mut core);
    register(&mut core, &mut alice, "alice");
    let mut robot = connect(&mut core);
    register(&mut core, &mut robot, "robot");

    send(&mut core, &robot, "MODE robot +B");
    assert!(robot.drain_joined().contains("MODE robot +B"));

    send(&mut core, &alice, "WHOIS robot");
    let lines = alice.drain_joined();
    assert!(lines.contains(" 311 alice robot"));
    assert!(lines.contains(" 335 alice robot :is a bot"), "got: {lines}");
    assert!(lines.contains(" 318 alice robot"));
}

#[tokio::test]
async fn no_nick_change_module_vetoes() {
    let mut core = server();
    let mut alice = connect(&mut core);
    register(&mut core, &mut alice, "alice");
    send(&mut core, &alice, "JOIN #frozen");
    send(&mut core, &alice, "MODE #frozen +N");
    alice.drain();

    send(&mut core, &alice, "NICK alicia");
    let lines = alice.drain_joined();
    assert!(lines.contains("#frozen has +N set"), "got: {lines}");
    assert_eq!(core.state.clients.by_nick("alicia"), None);
    assert_eq!(core.state.clients.by_nick("alice"), Some(alice.id));
}

#[tokio::test]
async fn flood_violations_disconnect() {
    let mut core = server();
    let mut alice = connect(&mut core);
    register(&mut core, &mut alice, "alice");
    alice.drain();

    // Tighten the window after the handshake traffic.
    core.state.config.ratelimit.messages = 3;
    core.state.config.ratelimit.max_violations = 2;
    core.state
        .clients
        .get_mut(alice.id)
        .unwrap()
        .msgs_in_window = 0;

    for _ in 0..4 {
        send(&mut core, &alice, "PING :x");
    }
    // One violation so far: warned, still connected.
    assert!(core.state.clients.get(alice.id).is_some());
    assert!(alice.drain_joined().contains("rate exceeded"));

    send(&mut core, &alice, "PING :x");
    assert!(core.state.clients.get(alice.id).is_none());
}
