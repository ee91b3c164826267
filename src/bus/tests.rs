use super::*;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Ping {
    n: u32,
}

impl BusMessage for Ping {
    const MESSAGE_TYPE: &'static str = "test.Ping";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Pong {
    n: u32,
}

impl BusMessage for Pong {
    const MESSAGE_TYPE: &'static str = "test.Pong";
}

#[test]
fn test_envelope_decodes_own_type() {
    let envelope = Envelope::new(&Ping { n: 7 }, Address::controller()).unwrap();
    assert_eq!(envelope.message_type, "test.Ping");
    assert!(envelope.is::<Ping>());
    assert_eq!(envelope.decode::<Ping>().unwrap(), Ping { n: 7 });
}

#[test]
fn test_envelope_rejects_other_type() {
    let envelope = Envelope::new(&Ping { n: 7 }, Address::controller()).unwrap();
    let err = envelope.decode::<Pong>().unwrap_err();
    assert!(matches!(err, BusError::TypeMismatch { expected: "test.Pong", .. }));
    assert_eq!(err.class(), ErrorClass::Configuration);
}

#[test]
fn test_envelope_builders() {
    let envelope = Envelope::new(&Ping { n: 1 }, Address::agent(Role::VmHostAgent, "host-1"))
        .unwrap()
        .with_reply_to(Address::controller())
        .with_correlation_id("saga-1");
    assert_eq!(envelope.reply_to, Some(Address::controller()));
    assert_eq!(envelope.correlation_id.as_deref(), Some("saga-1"));
    assert_eq!(envelope.destination.to_string(), "vm_host_agent/host-1");
}

#[test]
fn test_subscription_matches_role() {
    let sub = Subscription::role(Role::Controller);
    assert!(sub.matches(&Address::controller()));
    assert!(!sub.matches(&Address::role(Role::VmHostAgent)));
}

#[test]
fn test_agent_subscription_matches_only_its_agent() {
    let sub = Subscription::agent(Role::VmHostAgent, "host-1");
    assert!(sub.matches(&Address::agent(Role::VmHostAgent, "host-1")));
    assert!(!sub.matches(&Address::agent(Role::VmHostAgent, "host-2")));
    // Role-wide messages reach every agent of the role.
    assert!(sub.matches(&Address::role(Role::VmHostAgent)));
}

#[test]
fn test_role_subscription_receives_agent_messages() {
    let sub = Subscription::role(Role::NetworkAgent);
    assert!(sub.matches(&Address::agent(Role::NetworkAgent, "net-1")));
}

#[test]
fn test_transport_errors_are_transient() {
    assert_eq!(
        BusError::Publish("down".to_string()).class(),
        ErrorClass::TransientInfra
    );
    assert_eq!(
        BusError::Routing(RoutingError::UnknownMessageType("x".to_string())).class(),
        ErrorClass::Configuration
    );
}
