// tandem-common: wire types and client-side replay shared by the Tandem server and clients

pub mod protocol;
pub mod replay;
pub mod types;
