//! HTTP 接口层
//!
//! 只做参数提取与响应包装，兑换语义全部在服务层。
//! 用户身份由上游网关校验后通过 `X-User-Id` 头传入。

mod extract;
mod handlers;
mod response;
mod routes;
mod state;

pub use extract::{CurrentUser, JsonBody, USER_ID_HEADER};
pub use response::ApiResponse;
pub use routes::{api_routes, build_router};
pub use state::AppState;
