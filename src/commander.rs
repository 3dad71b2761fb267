use std::sync::Arc;

use bytes::BufMut;
use tracing::trace;

use crate::crtp::ack_sender::AckSender;
use crate::crtp::packet::{ports, Packet};

pub const CHANNEL_SETPOINT: u8 = 0;

/// Sends flight setpoints to the vehicle. Setpoints are sent fire-and-forget: the vehicle does
///  not answer them, and a lost setpoint is superseded by the next one.
pub struct Commander {
    ack_sender: Arc<AckSender>,
}

impl Commander {
    pub fn new(ack_sender: Arc<AckSender>) -> Commander {
        Commander { ack_sender }
    }

    /// roll, pitch and yaw in degrees, thrust from 0 to 65535
    pub async fn send_setpoint(&self, roll: f32, pitch: f32, yaw: f32, thrust: u16) -> anyhow::Result<()> {
        trace!("setpoint: roll={} pitch={} yaw={} thrust={}", roll, pitch, yaw, thrust);
        self.ack_sender.send(Self::setpoint_packet(roll, pitch, yaw, thrust)?, false).await;
        Ok(())
    }

    /// Stops the motors. This is sent before a link is closed.
    pub async fn send_stop_setpoint(&self) -> anyhow::Result<()> {
        self.send_setpoint(0.0, 0.0, 0.0, 0).await
    }

    fn setpoint_packet(roll: f32, pitch: f32, yaw: f32, thrust: u16) -> anyhow::Result<Packet> {
        let mut payload = Vec::with_capacity(14);
        payload.put_f32_le(roll);
        payload.put_f32_le(pitch);
        payload.put_f32_le(yaw);
        payload.put_u16_le(thrust);
        Packet::new(ports::COMMANDER, CHANNEL_SETPOINT, payload)
    }
}
