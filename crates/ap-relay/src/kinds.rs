//! Kind code tables: the NIP-29 group kinds plus this relay's custom kinds.

// NIP-29 moderation actions (client -> relay)
pub const GROUP_PUT_USER: u16 = 9000;
pub const GROUP_REMOVE_USER: u16 = 9001;
pub const GROUP_EDIT_METADATA: u16 = 9002;
pub const GROUP_DELETE_EVENT: u16 = 9005;
pub const GROUP_CREATE_GROUP: u16 = 9007;
pub const GROUP_DELETE_GROUP: u16 = 9008;
pub const GROUP_CREATE_INVITE: u16 = 9009;
pub const GROUP_JOIN_REQUEST: u16 = 9021;
pub const GROUP_LEAVE_REQUEST: u16 = 9022;

// NIP-29 group state (relay -> clients, addressable by group id)
pub const GROUP_METADATA: u16 = 39000;
pub const GROUP_ADMINS: u16 = 39001;
pub const GROUP_MEMBERS: u16 = 39002;
pub const GROUP_ROLES: u16 = 39003;

// Relay-custom kinds
pub const RELAY_ADD_MEMBER: u16 = 8934;
pub const RELAY_REMOVE_MEMBER: u16 = 8935;
pub const RELAY_INVITE: u16 = 8936;
pub const RELAY_MEMBERS: u16 = 18934;
pub const RELAY_JOIN: u16 = 28934;
pub const RELAY_LEAVE: u16 = 28935;

// Standard kinds the pipeline special-cases
pub const APPLICATION_DATA: u16 = 30078;
pub const GIFT_WRAP: u16 = 1059;
pub const ZAP_RECEIPT: u16 = 9735;
pub const CLIENT_AUTH: u16 = 22242;

/// Application-data d-values used for the relay's own bookkeeping. Events
/// carrying this prefix are never served to clients.
pub const INTERNAL_DATA_PREFIX: &str = "apiary/";
pub const BANNED_PUBKEYS_D: &str = "apiary/banned-pubkeys";
pub const BANNED_EVENTS_D: &str = "apiary/banned-events";

/// Group id reserved for relay-level state (e.g. the relay admins list).
pub const RELAY_SENTINEL_GROUP: &str = "_";

pub const METADATA_KINDS: [u16; 4] = [GROUP_METADATA, GROUP_ADMINS, GROUP_MEMBERS, GROUP_ROLES];

pub const MODERATION_KINDS: [u16; 6] = [
    GROUP_PUT_USER,
    GROUP_REMOVE_USER,
    GROUP_EDIT_METADATA,
    GROUP_DELETE_EVENT,
    GROUP_CREATE_GROUP,
    GROUP_DELETE_GROUP,
];

pub fn is_metadata_kind(kind: u16) -> bool {
    METADATA_KINDS.contains(&kind)
}

pub fn is_moderation_kind(kind: u16) -> bool {
    MODERATION_KINDS.contains(&kind)
}
