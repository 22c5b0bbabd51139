pub mod rest;

pub use rest::AlpacaRestClient;
