use axum::Router;

use crate::app::AppContext;

/// Trait for composable route modules
///
/// Each module registers its own routes and is merged into the main
/// application by [`App::register_module`](crate::App::register_module).
///
/// # Example
///
/// ```ignore
/// struct AdminModule;
///
/// impl RouteModule for AdminModule {
///     fn routes(&self) -> Router<AppContext> {
///         Router::new().route("/records/:user_id", get(get_record))
///     }
///
///     fn prefix(&self) -> Option<&str> {
///         Some("/admin")
///     }
/// }
/// ```
pub trait RouteModule {
    /// Returns a router with all routes for this module
    ///
    /// The router should NOT have state applied. Handlers use
    /// `State<AppContext>`, which the App provides when it is served.
    fn routes(&self) -> Router<AppContext>;

    /// Optional: specify a path prefix for all routes in this module
    fn prefix(&self) -> Option<&str> {
        None
    }

    /// Registers this module's routes into the application router
    fn register(self, router: Router<AppContext>) -> Router<AppContext>
    where
        Self: Sized,
    {
        let routes = self.routes();

        if let Some(prefix) = self.prefix() {
            router.nest(prefix, routes)
        } else {
            router.merge(routes)
        }
    }
}
