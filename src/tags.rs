//! Property tags the sync engine itself interprets. Everything else is opaque.
use crate::tree::PropTag;

pub const ENTRYID: PropTag = 0x0FFF_0102;
pub const MESSAGE_FLAGS: PropTag = 0x0E07_0003;
pub const DISPLAY_NAME: PropTag = 0x3001_001F;
pub const ATTACH_DATA_BIN: PropTag = 0x3701_0102;
pub const CONFLICT_ITEMS: PropTag = 0x1098_1102;
pub const SOURCE_KEY: PropTag = 0x65E0_0102;
pub const PARENT_SOURCE_KEY: PropTag = 0x65E1_0102;
pub const CHANGE_KEY: PropTag = 0x65E2_0102;
pub const PREDECESSOR_CHANGE_LIST: PropTag = 0x65E3_0102;
pub const ASSOCIATED: PropTag = 0x67AA_000B;
/// Multi-valued binary holding the conflict folder ids on the root folder.
pub const ADDITIONAL_REN_ENTRYIDS: PropTag = 0x36D8_1102;

pub const MSGFLAG_READ: u32 = 0x0001;
pub const MSGFLAG_ASSOCIATED: u32 = 0x0040;

/// Identity properties a conflict copy must not inherit.
pub const CONFLICT_EXCLUDED: [PropTag; 5] = [
    ENTRYID,
    CONFLICT_ITEMS,
    SOURCE_KEY,
    CHANGE_KEY,
    PREDECESSOR_CHANGE_LIST,
];
