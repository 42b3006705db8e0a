//! Utility
pub(crate) mod intrusive_list;
mod prio_bitmap;

pub(crate) use self::prio_bitmap::{PrioBitmap, PRIO_BITMAP_MAX_LEN};
