pub mod packet;
pub mod link;
pub mod udp_driver;
pub mod dispatcher;
pub mod ack_sender;
pub mod packet_receiver;
