use std::sync::Arc;
use std::time::Duration;

use kb_events::{EventBus, EventKind};

use crate::context::{CancelToken, CorrelationId, RequestContext};
use crate::loader::{LoadRequest, LoadStatus};

mod support;
use support::*;

mod invariants;
