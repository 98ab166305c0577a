// Application state for HTTP handlers
use crate::application::dispatcher::Dispatcher;
use crate::application::timeseries_service::TimeseriesStore;

#[derive(Clone)]
pub struct AppState {
    pub store: TimeseriesStore,
    pub dispatcher: Dispatcher,
}
