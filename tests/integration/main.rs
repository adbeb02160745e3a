//! Integration tests driving a real server over loopback TCP.

mod helpers;

mod broadcast;
