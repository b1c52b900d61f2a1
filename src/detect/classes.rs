//! COCO class ids used by the kitchen-sink policies.
//!
//! Ids follow the 80-class YOLO ordering. `PERSON` stands in for hands: the
//! pose model reports people, and a person reaching into the sink is what
//! makes it attended.

pub const PERSON: u16 = 0;
pub const BOTTLE: u16 = 39;
pub const WINE_GLASS: u16 = 40;
pub const CUP: u16 = 41;
pub const FORK: u16 = 42;
pub const KNIFE: u16 = 43;
pub const SPOON: u16 = 44;
pub const BOWL: u16 = 45;

pub const UTENSILS: &[u16] = &[BOTTLE, WINE_GLASS, CUP, FORK, KNIFE, SPOON, BOWL];

pub fn is_hand(class_id: u16) -> bool {
    class_id == PERSON
}

pub fn is_utensil(class_id: u16) -> bool {
    UTENSILS.contains(&class_id)
}

pub fn class_name(class_id: u16) -> &'static str {
    match class_id {
        PERSON => "person",
        BOTTLE => "bottle",
        WINE_GLASS => "wine glass",
        CUP => "cup",
        FORK => "fork",
        KNIFE => "knife",
        SPOON => "spoon",
        BOWL => "bowl",
        _ => "object",
    }
}
