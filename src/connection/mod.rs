pub mod connection_events;
pub mod connection_state;
pub mod crazyflie;
