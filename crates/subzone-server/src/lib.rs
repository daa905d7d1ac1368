// subzone-server — the zone server core: session state machine, auth
// pipeline, arena registry, map store, brick engine, LVZ object store,
// peer federation, chat relay, and capability store, tied together by the
// packet router and main-loop frame in sv_main.

pub mod arena;
pub mod auth;
pub mod brick;
pub mod capman;
pub mod chat;
pub mod ext;
pub mod lvz;
pub mod mapdata;
pub mod net;
pub mod peer;
pub mod server;
pub mod session;
pub mod sv_main;
