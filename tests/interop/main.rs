mod common;

mod cancel;
mod fairness;
mod locking;
mod oplock;
mod session;
mod transact;
