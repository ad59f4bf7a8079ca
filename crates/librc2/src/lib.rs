pub mod coder;
pub mod config;
pub mod dao;
pub mod error;
pub mod framing;
pub mod orchestration;
pub mod registry;
pub mod session;
pub mod socket;
pub mod worker;

pub use coder::{ComputeCoder, ComputeResponse, OpenParams, QueryId};
pub use config::AppConfig;
pub use dao::{MemoryDao, Rc2Dao};
pub use error::{ComputeError, ConfigError, DaoError, OrchestrationError};
pub use framing::{ComputeFrame, ComputeFrameCodec, FrameError};
pub use orchestration::{K8sServer, Orchestrator, PodPhase, PodStatus};
pub use registry::{Admission, SessionRegistry};
pub use session::{Session, SessionClosed, SessionConfig};
pub use socket::{ClientSocket, SocketId};
pub use worker::{ComputeEvent, ComputeTarget, ComputeWorker, WorkerConfig};
