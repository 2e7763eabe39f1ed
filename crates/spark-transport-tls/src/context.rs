use std::{fmt, sync::Arc};

use arc_swap::ArcSwap;
use rustls::{ClientConfig, ClientConnection, ServerConfig, ServerConnection};
use rustls_pki_types::ServerName;

use crate::{
    engine::RustlsEngine,
    error::{EngineError, TlsError},
};

/// 按连接创建 TLS 引擎的工厂，内部配置可热更新。
///
/// # 设计动机（Why）
/// - **零中断目标**：证书轮换时只需替换配置快照，已建立的会话继续持有旧 `Arc`，
///   新连接立即使用新配置；
/// - **架构角色**：位于证书管理与会话驱动之间，每个新套接字从这里取得一个独立的 [`RustlsEngine`]。
///
/// # 实现逻辑（How）
/// - 以 `ArcSwap<C>` 保存配置，读路径无锁，写路径通过 `swap` 原子替换；
/// - 服务端与客户端分别由 `TlsContext<ServerConfig>` 与 `TlsContext<ClientConfig>` 提供引擎构造方法，
///   角色在类型层面即确定。
///
/// # 风险提示（Trade-offs & Gotchas）
/// - 高频更新时会暂存多个配置快照，需结合连接并发度评估内存峰值；
/// - 写入的配置必须已完成证书链与私钥装载。
pub struct TlsContext<C> {
    config: Arc<ArcSwap<C>>,
}

impl<C> Clone for TlsContext<C> {
    fn clone(&self) -> Self {
        Self {
            config: Arc::clone(&self.config),
        }
    }
}

impl<C> TlsContext<C> {
    pub fn new(initial: Arc<C>) -> Self {
        Self {
            config: Arc::new(ArcSwap::new(initial)),
        }
    }

    /// 获取当前配置的共享快照。
    #[inline]
    pub fn snapshot(&self) -> Arc<C> {
        self.config.load_full()
    }

    /// 用新的配置替换当前快照，并返回旧值；只影响之后创建的引擎。
    #[inline]
    pub fn replace(&self, next: Arc<C>) -> Arc<C> {
        self.config.swap(next)
    }
}

impl TlsContext<ServerConfig> {
    /// 为新接受的连接创建服务端引擎。
    pub fn new_engine(&self) -> Result<RustlsEngine, TlsError> {
        let conn = ServerConnection::new(self.snapshot()).map_err(EngineError::from)?;
        Ok(RustlsEngine::new(conn))
    }
}

impl TlsContext<ClientConfig> {
    /// 为新发起的连接创建客户端引擎。
    pub fn new_engine(&self, server_name: ServerName<'static>) -> Result<RustlsEngine, TlsError> {
        let conn =
            ClientConnection::new(self.snapshot(), server_name).map_err(EngineError::from)?;
        Ok(RustlsEngine::new(conn))
    }
}

impl<C> fmt::Debug for TlsContext<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsContext").finish_non_exhaustive()
    }
}
