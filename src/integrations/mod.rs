pub mod nmap_tracker;
pub mod ombi;
pub mod zwave;
