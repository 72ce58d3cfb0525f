pub mod device;
pub mod registry;
pub mod sfu;
pub mod sfu_client;
pub mod simulcast;

pub use device::{
    CapturePlatform, Constrain, DeviceKind, MediaDeviceInfo, MediaStream, MediaTrack,
    TrackCapabilities, TrackSettings, TrackState, ValueRange, VideoConstraints,
};
pub use registry::{CaptureEvent, DeviceRegistry};
pub use sfu::{
    DtlsState, ProduceNegotiation, Producer, ProducerAppData, ProducerOptions, RtpEncoding,
    SendTransport, SfuBackend, SfuDevice, TransportListener,
};
pub use sfu_client::{NegotiationSignal, SfuClient};
pub use simulcast::{
    build_plan, compute_tier_bitrate, derive_resolution_ladder, Resolution, SimulcastPlan,
    SimulcastPlanner, SimulcastTier, PRESET_HEIGHTS,
};
