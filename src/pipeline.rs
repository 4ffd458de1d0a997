//! The message handler: handler selection, response initialisation, phase
//! dispatch and short-circuit handling.
//!
//! Selection order is fixed: the mandatory setup handlers, then the handlers
//! contributed by matching filters (most specific branch first), then the
//! root handlers, then the cleanup handlers. Every selected handler runs
//! every phase in order: all `pre` calls, `init_response`, all `handle`
//! calls, all `post` calls. The `analyse_pre`/`analyse_post` hooks run
//! around the whole thing, short-circuit or not.

use log::{debug, error, warn};

use sedge_proto::message::{ClientServerMessage, MessageType};
use sedge_proto::options::DhcpOption;
use sedge_proto::Duid;

use crate::bundle::TransactionBundle;
use crate::config::Config;
use crate::filters::Filter;
use crate::handlers::rate_limit::RateLimitCounters;
use crate::handlers::relay::{InterfaceIdOptionHandler, RelayEchoRequestHandler};
use crate::handlers::standard::{
    AddMissingStatusHandler, ClientIdHandler, RapidCommitHandler, RejectUnwantedUnicastHandler,
    ServerIdHandler, UnansweredIaHandler,
};
use crate::handlers::{build_handler, BuildContext, Handler, HandlerError};
use crate::leasequery::sqlite::SqliteLeasequeryStore;
use crate::leasequery::{
    LeasequeryHandler, RefuseBulkQueryTypesOverUdpHandler, RequireLeasequeryOverTcpHandler,
    UnansweredLeasequeryHandler,
};
use crate::statistics::StatisticsSet;
use crate::ServerError;

/// Where a selected handler lives inside the pipeline.
enum HandlerRef {
    Setup(usize),
    Filtered(Vec<usize>, usize),
    Own(usize),
    Cleanup(usize),
}

pub struct MessageHandler {
    server_duid: Duid,
    allow_rapid_commit: bool,

    setup_handlers: Vec<Box<dyn Handler>>,
    sub_filters: Vec<Filter>,
    sub_handlers: Vec<Box<dyn Handler>>,
    cleanup_handlers: Vec<Box<dyn Handler>>,
}

impl MessageHandler {
    /// Build a pipeline from configuration. Every worker builds its own so
    /// handlers can own unshareable resources; the rate-limit counter states
    /// in `rate_limiters` are the one deliberately shared piece.
    pub fn build(
        config: &Config,
        rate_limiters: &[std::sync::Arc<RateLimitCounters>],
    ) -> Result<Self, ServerError> {
        let server_duid = config.server.server_duid()?;

        let mut ctx = BuildContext {
            rate_limiters,
            next_rate_limiter: 0,
        };

        let mut sub_filters = Vec::new();
        for filter_config in &config.filters {
            sub_filters.push(Filter::build(filter_config, &mut ctx)?);
        }

        let mut sub_handlers = Vec::new();
        for handler_config in &config.handlers {
            sub_handlers.push(build_handler(handler_config, &mut ctx)?);
        }

        if let Some(leasequery) = &config.leasequery {
            let store = SqliteLeasequeryStore::new(&leasequery.store)?;
            sub_handlers.push(Box::new(LeasequeryHandler::new(
                Box::new(store),
                leasequery.allow_from.clone(),
                leasequery.sensitive_option_codes()?,
            )));
        }

        // The mandatory handlers around the configured ones
        let mut setup_handlers: Vec<Box<dyn Handler>> = Vec::new();
        if config.server.allow_rapid_commit {
            setup_handlers.push(Box::new(RapidCommitHandler {
                rapid_commit_rejections: config.server.rapid_commit_rejections,
            }));
        }
        setup_handlers.push(Box::new(ServerIdHandler::new(server_duid.clone())));
        setup_handlers.push(Box::new(ClientIdHandler::new()));
        setup_handlers.push(Box::new(InterfaceIdOptionHandler::new()));
        setup_handlers.push(Box::new(RequireLeasequeryOverTcpHandler));
        setup_handlers.push(Box::new(RefuseBulkQueryTypesOverUdpHandler));

        let cleanup_handlers: Vec<Box<dyn Handler>> = vec![
            Box::new(RelayEchoRequestHandler),
            Box::new(UnansweredLeasequeryHandler),
            Box::new(RejectUnwantedUnicastHandler),
            Box::new(UnansweredIaHandler),
            Box::new(AddMissingStatusHandler),
        ];

        Ok(Self {
            server_duid,
            allow_rapid_commit: config.server.allow_rapid_commit,
            setup_handlers,
            sub_filters,
            sub_handlers,
            cleanup_handlers,
        })
    }

    /// Per-worker initialisation, called exactly once after the build.
    pub fn worker_init(&mut self) -> Result<(), ServerError> {
        for handler in &mut self.setup_handlers {
            handler.worker_init()?;
        }
        for filter in &mut self.sub_filters {
            filter.worker_init()?;
        }
        for handler in &mut self.sub_handlers {
            handler.worker_init()?;
        }
        for handler in &mut self.cleanup_handlers {
            handler.worker_init()?;
        }

        Ok(())
    }

    fn select(&self, bundle: &TransactionBundle) -> Vec<HandlerRef> {
        let mut selected = Vec::new();

        for index in 0..self.setup_handlers.len() {
            selected.push(HandlerRef::Setup(index));
        }

        let mut filtered = Vec::new();
        for (index, filter) in self.sub_filters.iter().enumerate() {
            let mut path = vec![index];
            filter.collect(bundle, &mut path, &mut filtered);
        }
        selected.extend(
            filtered
                .into_iter()
                .map(|(path, index)| HandlerRef::Filtered(path, index)),
        );

        for index in 0..self.sub_handlers.len() {
            selected.push(HandlerRef::Own(index));
        }
        for index in 0..self.cleanup_handlers.len() {
            selected.push(HandlerRef::Cleanup(index));
        }

        selected
    }

    fn handler_mut(&mut self, reference: &HandlerRef) -> &mut dyn Handler {
        match reference {
            HandlerRef::Setup(index) => self.setup_handlers[*index].as_mut(),
            HandlerRef::Own(index) => self.sub_handlers[*index].as_mut(),
            HandlerRef::Cleanup(index) => self.cleanup_handlers[*index].as_mut(),
            HandlerRef::Filtered(path, index) => {
                self.sub_filters[path[0]].handler_at_mut(&path[1..], *index)
            }
        }
    }

    /// Create the response message matching the request type.
    fn init_response(&self, bundle: &mut TransactionBundle) -> Result<(), HandlerError> {
        let Some(request) = &bundle.request else {
            return Err(HandlerError::cannot_respond("no request to respond to"));
        };

        let response_type = match request.message_type {
            MessageType::Solicit => MessageType::Advertise,

            MessageType::Request
            | MessageType::Renew
            | MessageType::Rebind
            | MessageType::Release
            | MessageType::Decline
            | MessageType::InformationRequest => MessageType::Reply,

            MessageType::Confirm => {
                // A Confirm without any address or prefix must not be
                // answered at all
                let has_contents = request.ia_options().any(|option| {
                    option.sub_options().iter().any(|sub| {
                        matches!(sub, DhcpOption::IaAddress(_) | DhcpOption::IaPrefix(_))
                    })
                });
                if !has_contents {
                    return Err(HandlerError::cannot_respond(
                        "No addresses in any IA of the confirm request",
                    ));
                }

                MessageType::Reply
            }

            MessageType::Leasequery => MessageType::LeasequeryReply,

            other => {
                return Err(HandlerError::CannotRespond(format!(
                    "Do not know how to reply to {}",
                    other.class_name()
                )))
            }
        };

        bundle.response = Some(ClientServerMessage::new(
            response_type,
            request.transaction_id,
        ));
        bundle.create_outgoing_relay_messages();

        Ok(())
    }

    fn run_phases(
        &mut self,
        selected: &[HandlerRef],
        bundle: &mut TransactionBundle,
    ) -> Result<(), HandlerError> {
        for reference in selected {
            self.handler_mut(reference).pre(bundle)?;
        }

        self.init_response(bundle)?;

        for reference in selected {
            let handler = self.handler_mut(reference);
            debug!("Applying {}", handler.name());
            handler.handle(bundle)?;
        }

        for reference in selected {
            self.handler_mut(reference).post(bundle)?;
        }

        Ok(())
    }

    fn construct_status_reply(
        &self,
        bundle: &TransactionBundle,
        status: sedge_proto::options::StatusCodeOption,
        leasequery: bool,
    ) -> Option<ClientServerMessage> {
        let request = bundle.request.as_ref()?;

        let response_type = if leasequery {
            MessageType::LeasequeryReply
        } else {
            MessageType::Reply
        };

        let mut response = ClientServerMessage::new(response_type, request.transaction_id);
        if let Some(client_id) = request.option_of_code(sedge_proto::options::OPTION_CLIENTID) {
            response.options.push(client_id.clone());
        }
        response
            .options
            .push(DhcpOption::ServerId(self.server_duid.clone()));
        response.options.push(DhcpOption::StatusCode(status));

        Some(response)
    }

    fn construct_use_multicast_reply(
        &self,
        bundle: &TransactionBundle,
    ) -> Option<ClientServerMessage> {
        if bundle.received_over_multicast {
            // A client error we cannot helpfully answer
            error!("Not telling client to use multicast, they already did");
            return None;
        }

        self.construct_status_reply(
            bundle,
            sedge_proto::options::StatusCodeOption::new(
                sedge_proto::options::STATUS_USE_MULTICAST,
                "You cannot send requests directly to this server, \
                 please use the proper multicast addresses",
            ),
            false,
        )
    }

    /// The main dispatcher for one bundle.
    pub fn handle(&mut self, bundle: &mut TransactionBundle, statistics: &StatisticsSet) {
        if bundle.request.is_none() {
            return;
        }

        bundle.allow_rapid_commit = self.allow_rapid_commit;

        if let Some(request) = &bundle.request {
            statistics.count_message_in(request.message_type);
        }

        debug!("Handling {}", bundle.describe());

        let selected = self.select(bundle);

        for reference in &selected {
            self.handler_mut(reference).analyse_pre(bundle);
        }

        match self.run_phases(&selected, bundle) {
            Ok(()) => {}

            Err(HandlerError::ForOtherServer(message)) => {
                debug!("{}: ignoring", message);
                statistics.count_for_other_server();
                bundle.response = None;
                bundle.responses.clear();
            }

            Err(HandlerError::CannotRespond(message)) => {
                warn!("{}: ignoring", message);
                statistics.count_do_not_respond();
                bundle.response = None;
                bundle.responses.clear();
            }

            Err(HandlerError::UseMulticast(_)) => {
                debug!("Unicast request received when multicast is required: informing client");
                statistics.count_use_multicast();
                bundle.responses.clear();
                bundle.response = self.construct_use_multicast_reply(bundle);
            }

            Err(error @ HandlerError::ReplyWithStatus { .. }) => {
                warn!("{}", error);
                match error.counter() {
                    crate::handlers::Counter::UnknownQueryType => {
                        statistics.count_unknown_query_type()
                    }
                    crate::handlers::Counter::MalformedQuery => statistics.count_malformed_query(),
                    crate::handlers::Counter::NotAllowed => statistics.count_not_allowed(),
                    _ => statistics.count_other_error(),
                }

                let HandlerError::ReplyWithStatus { status, leasequery } = error else {
                    unreachable!()
                };
                bundle.responses.clear();
                bundle.response = self.construct_status_reply(bundle, status, leasequery);
            }
        }

        for reference in &selected {
            let handler = self.handler_mut(reference);
            if let Err(e) = handler.analyse_post(bundle) {
                error!("{} post analysis failed: {}", handler.name(), e);
            }
        }

        if let Some(response) = &bundle.response {
            debug!("Responding with {}", response.message_type.class_name());
            statistics.count_message_out(response.message_type);
        } else {
            debug!("Not responding");
        }
    }
}
