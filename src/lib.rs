pub mod lct;
pub mod oti;
pub mod partition;
pub mod fec;
pub mod alc;
pub mod cenc;
pub mod fdt;
pub mod sender;
pub mod receiver;

pub use lct::{LctHeader, HeaderExtension};
pub use oti::{FecEncodingId, Oti};
pub use partition::{partition, BlockDescriptor, Layout};
pub use fec::{FecCodec, FecRegistry, get_codec};
pub use alc::AlcPacket;
pub use cenc::ContentEncoding;
pub use fdt::{FdtFile, FdtInstance};
pub use sender::{ObjectOptions, Sender, SenderConfig};
pub use receiver::{MultiReceiver, Receiver, ReceiverConfig, UdpEndpoint};
