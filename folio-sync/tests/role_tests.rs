use folio_sync::{Role, RoleNegotiator, SyncError};
use folio_types::DeviceId;
use proptest::prelude::*;

fn device(id: &str) -> DeviceId {
    DeviceId::new(id).unwrap()
}

#[test]
fn smaller_id_is_server() {
    let a = device("device-a");
    let b = device("device-b");
    assert_eq!(RoleNegotiator::negotiate(&a, &b, true).unwrap(), Role::Server);
    assert_eq!(RoleNegotiator::negotiate(&b, &a, false).unwrap(), Role::Client);
}

#[test]
fn initiator_flag_does_not_change_roles() {
    let a = device("device-a");
    let b = device("device-b");
    assert_eq!(
        RoleNegotiator::negotiate(&a, &b, true).unwrap(),
        RoleNegotiator::negotiate(&a, &b, false).unwrap()
    );
}

#[test]
fn self_connection_is_rejected() {
    let a = device("device-a");
    assert!(matches!(
        RoleNegotiator::negotiate(&a, &a, true),
        Err(SyncError::ConnectionFailed(_))
    ));
}

#[test]
fn client_sends_first() {
    assert!(Role::Client.sends_first());
    assert!(!Role::Server.sends_first());
    assert_eq!(Role::Client.opposite(), Role::Server);
    assert_eq!(Role::Server.to_string(), "SERVER");
}

proptest! {
    #[test]
    fn distinct_ids_get_opposite_roles(
        a in "[a-zA-Z0-9-]{1,24}",
        b in "[a-zA-Z0-9-]{1,24}",
        initiator in any::<bool>(),
    ) {
        prop_assume!(a != b);
        let a = device(&a);
        let b = device(&b);
        let ours = RoleNegotiator::negotiate(&a, &b, initiator).unwrap();
        let theirs = RoleNegotiator::negotiate(&b, &a, !initiator).unwrap();
        prop_assert_eq!(ours.opposite(), theirs);
    }
}
