//! perch — rendezvous and presence metaserver (lobby) for multiplayer
//! games. Clients log in over a framed TCP protocol, see each other in a
//! live roster, chat, and are kept alive by a ping cycle.

pub mod lobby;
