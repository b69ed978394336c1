pub mod bg_services;
pub mod gatekeeper;
pub mod proxy;
