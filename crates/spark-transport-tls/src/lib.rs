#![doc = r#"
# spark-transport-tls

## 设计动机（Why）
- **非阻塞 TLS**：事件驱动的套接字框架不能在握手或记录解密时阻塞 I/O 线程；
  本 crate 把 TLS 拆成显式的 wrap/unwrap 步骤，任何一步缺少输入都挂起，待下一次读写事件继续；
- **引擎可替换**：会话驱动只依赖 [`TlsEngine`] 协议，生产环境使用 [`RustlsEngine`]，
  测试使用 [`test_stubs::LoopbackEngine`] 复现挂起、扩容与关闭时序；
- **热更新**：[`TlsContext`] 以 `ArcSwap` 保存配置快照，证书轮换不影响已建立的连接。

## 核心契约（What）
- [`TlsConnection`]：单个套接字的串行化边界，对外提供开始握手、读事件处理、写入、关闭钩子；
- [`TlsSession`]：握手状态机、密文累积区与关闭状态的唯一所有者；
- [`RecordDecryptor`] / [`RecordEncryptor`]：读写两侧的记录处理，明文按 FIFO 交付给 [`ReadRequests`]；
- [`SocketIo`]：驱动对底层套接字的全部依赖（写出、关闭、上报故障、调度恢复）；
- 错误统一为 [`TlsError`]，并提供稳定错误码与 [`ErrorClass`] 分类。

## 实现策略（How）
- 所有缓冲来自 `spark-buffer` 的 [`SlabBufferPool`](spark_buffer::SlabBufferPool)，租约在 `Drop` 时归还；
- 会话在持锁期间只记录副作用，连接在释放锁之后按序派发，回调可以安全重入；
- 委托任务按 [`TlsDriverConfig`] 在调用线程内联执行或投递到 [`TaskPool`]，完成后经 [`SocketIo::wake`] 恢复握手。

## 风险与考量（Trade-offs）
- rustls 不支持重新协商：对端发起的重新协商会以引擎故障上报；
- [`ReadRequests::deliver`] 在连接锁内调用，实现方不得同步重入同一连接；
- 累积区默认随包尺寸增长且无上限，面向不可信对端时建议配置 `max_accumulation_bytes`。
"#]

mod config;
mod connection;
mod context;
pub mod engine;
mod error;
mod reader;
mod session;
mod socket;
mod tasks;
pub mod test_stubs;
mod writer;

pub use config::{DelegatedTaskPolicy, TlsDriverConfig};
pub use connection::TlsConnection;
pub use context::TlsContext;
pub use engine::{
    DelegatedTask, EngineResult, EngineStatus, HandshakeStatus, RustlsEngine, TlsEngine,
};
pub use error::{EngineError, ErrorClass, TlsError};
pub use reader::{PendingSupply, ReadRequests, RecordDecryptor};
pub use session::{
    CloseState, CompletionCallback, HandshakeState, SessionMode, TaskDispatch, TlsSession,
};
pub use socket::{DisconnectReason, Resume, SocketIo, WriteDone};
pub use tasks::TaskPool;
pub use writer::RecordEncryptor;
