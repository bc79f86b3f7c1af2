pub mod advertise;

pub use advertise::{Announcer, MdnsAnnouncer};
