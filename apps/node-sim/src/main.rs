//! `node-sim` runs a simulated IoT node on the host.
//!
//! The node reads a thermometer, a barometer, a hygrometer, a light sensor,
//! an inertial unit and the state of its LED, and delivers each reading to a
//! gateway at a fixed period, along with an "I am alive" beacon. All the
//! periodic jobs share a single scheduler task.
//!
//! With `CoAP`, readings are posted to the `/server` resource of the gateway
//! and the node serves its own resources. With `MQTT`, the node announces
//! itself to the broker, publishes each reading on its own topic and answers
//! the discovery and LED requests of the gateway.

mod sim;

use std::net::{Ipv6Addr, SocketAddr};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

use tokio_util::sync::CancellationToken;

use tracing::{Level, debug, error, info, warn};

use iotnode::job::{Job, job_fn};
use iotnode::jobs::{Beacon, PayloadFormat, PublishJob};
use iotnode::scheduler::{Scheduler, SchedulerHandle};
use iotnode::{Messenger, Sensor};

use iotnode_drivers::led::{Led, Polarity};
use iotnode_drivers::tsl2561::{Address, Tsl2561};

use iotnode_net::address::parse_endpoint;
use iotnode_net::coap::{self, Code, CoapClient, CoapServer, Request, Response};
use iotnode_net::mqtt::{MqttPublisher, Publication};
use iotnode_net::node::{self, GatewayRequest, NodeInfo};

use crate::sim::{Barometer, Hygrometer, Imu, LedPin, LightBus, Thermometer, TokioDelay};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

type SharedLed = Arc<Mutex<Led<LedPin>>>;

// Default port of the MQTT gateway.
const MQTT_DEFAULT_PORT: u16 = 1885;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Protocol {
    /// Post readings to a `CoAP` server.
    Coap,
    /// Publish readings on `MQTT` topics.
    Mqtt,
}

/// A simulated IoT node.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Node identifier
    #[arg(long, default_value = "node_id_0")]
    id: String,

    /// Protocol used to deliver readings and beacons
    #[arg(short, long, value_enum, default_value_t = Protocol::Coap)]
    protocol: Protocol,

    /// Gateway address: `[v6]:port`, `v4:port` or a bare address
    #[arg(short, long, default_value = "2001:660:3207:102::4")]
    gateway: String,

    /// Gateway port, when the address has none [default: 5683 for CoAP, 1885 for MQTT]
    #[arg(long)]
    gateway_port: Option<u16>,

    /// Port of the CoAP resource server
    #[arg(long, default_value_t = coap::DEFAULT_PORT)]
    coap_port: u16,

    /// Seconds between two readings of the same sensor
    #[arg(long, default_value_t = 5)]
    sensor_period: u64,

    /// Seconds between two beacons
    #[arg(long, default_value_t = node::BEACON_PERIOD.as_secs())]
    beacon_period: u64,

    /// Maximum number of periodic jobs
    #[arg(long, default_value_t = 8)]
    capacity: usize,

    /// Log debug messages
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn gateway(&self) -> Result<SocketAddr, BoxError> {
        let default_port = self.gateway_port.unwrap_or(match self.protocol {
            Protocol::Coap => coap::DEFAULT_PORT,
            Protocol::Mqtt => MQTT_DEFAULT_PORT,
        });
        Ok(parse_endpoint(&self.gateway, default_port)?)
    }
}

#[derive(Clone)]
struct Devices {
    thermometer: Arc<Mutex<Thermometer>>,
    barometer: Arc<Mutex<Barometer>>,
    hygrometer: Arc<Mutex<Hygrometer>>,
    light: Arc<Mutex<Tsl2561<LightBus>>>,
    imu: Arc<Mutex<Imu>>,
    led: SharedLed,
}

impl Devices {
    async fn init() -> Result<Self, BoxError> {
        let mut light = Tsl2561::new(LightBus::new(), Address::Float);
        light
            .enable(&mut TokioDelay)
            .await
            .map_err(|e| format!("Impossible to enable the light sensor: {e}"))?;

        let mut led = Led::new(LedPin::default(), Polarity::ActiveLow);
        led.off()
            .map_err(|e| format!("Impossible to switch the LED off: {e}"))?;

        Ok(Self {
            thermometer: Arc::new(Mutex::new(Thermometer::new())),
            barometer: Arc::new(Mutex::new(Barometer::new())),
            hygrometer: Arc::new(Mutex::new(Hygrometer::new())),
            light: Arc::new(Mutex::new(light)),
            imu: Arc::new(Mutex::new(Imu::new())),
            led: Arc::new(Mutex::new(led)),
        })
    }

    // Current value of every sensor, skipping the failed reads.
    async fn snapshot(&self) -> Vec<(&'static str, String)> {
        let readings = [
            ("temperature", current(&self.thermometer).await),
            ("pressure", current(&self.barometer).await),
            ("humidity", current(&self.hygrometer).await),
            ("illuminance", current(&self.light).await),
            ("imu", current(&self.imu).await),
            ("led", current(&self.led).await),
        ];

        readings
            .into_iter()
            .filter_map(|(label, value)| value.map(|value| (label, value)))
            .collect()
    }

    async fn register<M>(
        &self,
        scheduler: &SchedulerHandle,
        messenger: &Arc<M>,
        period: Duration,
        format: PayloadFormat,
        destination: impl Fn(&str) -> String,
    ) -> iotnode::error::Result<()>
    where
        M: Messenger + 'static,
    {
        let publish = Publish {
            scheduler,
            messenger,
            period,
            format,
            destination: &destination,
        };

        publish.job("temperature", &self.thermometer).await?;
        publish.job("pressure", &self.barometer).await?;
        publish.job("humidity", &self.hygrometer).await?;
        publish.job("illuminance", &self.light).await?;
        publish.job("imu", &self.imu).await?;
        publish.job("led", &self.led).await
    }
}

async fn current<S: Sensor>(sensor: &Arc<Mutex<S>>) -> Option<String> {
    match sensor.lock().await.read().await {
        Ok(reading) => Some(reading.to_string()),
        Err(e) => {
            warn!("Impossible to read a sensor: {e}");
            None
        }
    }
}

// Registers publishing jobs sharing the same messenger and period.
struct Publish<'a, M, D> {
    scheduler: &'a SchedulerHandle,
    messenger: &'a Arc<M>,
    period: Duration,
    format: PayloadFormat,
    destination: &'a D,
}

impl<M, D> Publish<'_, M, D>
where
    M: Messenger + 'static,
    D: Fn(&str) -> String,
{
    async fn job<S>(&self, label: &'static str, sensor: &Arc<Mutex<S>>) -> iotnode::error::Result<()>
    where
        S: Sensor + 'static,
    {
        let job = PublishJob::new(
            label,
            (self.destination)(label),
            self.format,
            Arc::clone(sensor),
            Arc::clone(self.messenger),
        );

        let key = self
            .scheduler
            .register(Job::new(label, self.period, job)?)
            .await?;
        info!("Publishing `{label}` every {:?} as {key}", self.period);

        Ok(())
    }
}

fn sensor_resource<S>(server: CoapServer, path: &str, sensor: &Arc<Mutex<S>>) -> CoapServer
where
    S: Sensor + 'static,
{
    let sensor = Arc::clone(sensor);
    server.route(Code::GET, path, move |_| {
        let sensor = Arc::clone(&sensor);
        async move {
            match current(&sensor).await {
                Some(value) => Response::text(value),
                None => Response::new(Code::INTERNAL_SERVER_ERROR),
            }
        }
    })
}

// An LED command is either `0` or `1`.
fn led_command(payload: &[u8]) -> Option<bool> {
    match payload.trim_ascii() {
        b"1" => Some(true),
        b"0" => Some(false),
        _ => None,
    }
}

async fn switch_led(led: &SharedLed, on: bool) -> bool {
    if let Err(e) = led.lock().await.set(on) {
        warn!("Impossible to switch the LED: {e}");
        return false;
    }
    true
}

async fn set_led(led: SharedLed, request: Request) -> Response {
    let Some(on) = led_command(&request.payload) else {
        return Response::bad_request("Expected `0` or `1`");
    };

    if !switch_led(&led, on).await {
        return Response::new(Code::INTERNAL_SERVER_ERROR);
    }

    info!("LED switched {} by {}", if on { "on" } else { "off" }, request.source);
    Response::changed()
}

fn node_server(server: CoapServer, info: &NodeInfo, devices: &Devices) -> Result<CoapServer, BoxError> {
    let server = server.node_resources(info)?;

    let server = sensor_resource(server, "temperature", &devices.thermometer);
    let server = sensor_resource(server, "pressure", &devices.barometer);
    let server = sensor_resource(server, "humidity", &devices.hygrometer);
    let server = sensor_resource(server, "illuminance", &devices.light);
    let server = sensor_resource(server, "imu", &devices.imu);
    let server = sensor_resource(server, "led", &devices.led);

    let put_led = Arc::clone(&devices.led);
    let post_led = Arc::clone(&devices.led);

    Ok(server
        .route(Code::PUT, "led", move |request| {
            set_led(Arc::clone(&put_led), request)
        })
        .route(Code::POST, "led", move |request| {
            set_led(Arc::clone(&post_led), request)
        }))
}

fn version_job(info: &NodeInfo, client: &Arc<CoapClient>, period: Duration) -> iotnode::error::Result<Job> {
    let client = Arc::clone(client);
    let payloads = [
        format!("version:{}", info.version),
        format!("appid:{}", info.app_id),
    ];

    Job::new(
        "version",
        period,
        job_fn(move || {
            let client = Arc::clone(&client);
            let payloads = payloads.clone();
            async move {
                for payload in payloads {
                    if let Err(e) = client.send(node::SERVER_PATH, payload.as_bytes()).await {
                        warn!("Impossible to send `{payload}`: {e}");
                    }
                }
            }
        }),
    )
}

async fn handle_gateway_request<M: Messenger>(
    messenger: &M,
    info: &NodeInfo,
    devices: &Devices,
    publication: &Publication,
) {
    match info.gateway_request(&publication.topic) {
        Some(GatewayRequest::Discover) => {
            let readings = devices.snapshot().await;
            if let Err(e) = node::discover(messenger, info, &publication.payload, &readings).await {
                warn!("Impossible to answer the discovery: {e}");
            }
        }
        Some(GatewayRequest::SetLed) => match led_command(&publication.payload) {
            Some(on) => {
                if switch_led(&devices.led, on).await {
                    info!("LED switched {} by the gateway", if on { "on" } else { "off" });
                }
            }
            None => warn!("Ignoring LED request {:?}, expected `0` or `1`", publication.text()),
        },
        None => debug!("Ignoring publication on `{}`", publication.topic),
    }
}

async fn serve_gateway(
    publisher: Arc<MqttPublisher>,
    info: NodeInfo,
    devices: Devices,
    mut inbox: mpsc::Receiver<Publication>,
    cancellation_token: CancellationToken,
) {
    loop {
        tokio::select! {
            () = cancellation_token.cancelled() => { break; }
            publication = inbox.recv() => {
                let Some(publication) = publication else {
                    break;
                };
                handle_gateway_request(publisher.as_ref(), &info, &devices, &publication).await;
            }
        }
    }
}

// What must be stopped along with the scheduler.
enum Link {
    Coap(JoinHandle<()>),
    Mqtt {
        publisher: Arc<MqttPublisher>,
        gateway: JoinHandle<()>,
    },
}

async fn start_coap(
    args: &Args,
    info: &NodeInfo,
    devices: &Devices,
    scheduler: &SchedulerHandle,
    cancellation_token: CancellationToken,
) -> Result<Link, BoxError> {
    let client = Arc::new(CoapClient::bind(args.gateway()?).await?);

    if let Err(e) = node::send_reset(client.as_ref(), info).await {
        warn!("{e}");
    }

    let beacon = Beacon::new(node::ALIVE_PATH, info.alive_payload(), Arc::clone(&client));
    let _ = scheduler
        .register(Job::new("beacon", Duration::from_secs(args.beacon_period), beacon)?)
        .await?;

    let period = Duration::from_secs(args.sensor_period);
    devices
        .register(scheduler, &client, period, PayloadFormat::Labelled, |_| {
            node::SERVER_PATH.to_owned()
        })
        .await?;
    let _ = scheduler
        .register(version_job(info, &client, period)?)
        .await?;

    let address = SocketAddr::from((Ipv6Addr::UNSPECIFIED, args.coap_port));
    let server = node_server(CoapServer::bind(address).await?, info, devices)?;

    Ok(Link::Coap(tokio::spawn(server.run(cancellation_token))))
}

async fn start_mqtt(
    args: &Args,
    info: &NodeInfo,
    devices: &Devices,
    scheduler: &SchedulerHandle,
    cancellation_token: CancellationToken,
) -> Result<Link, BoxError> {
    let (publisher, inbox) =
        MqttPublisher::connect(&info.id, args.gateway()?, info.subscriptions());
    let publisher = Arc::new(publisher);

    // The gateway can still ask for the resources later on.
    if let Err(e) = node::announce(publisher.as_ref(), info, &devices.snapshot().await).await {
        warn!("Incomplete announcement: {e}");
    }

    let beacon = Beacon::new(node::CHECK_TOPIC, info.check_payload()?, Arc::clone(&publisher));
    let _ = scheduler
        .register(Job::new("beacon", Duration::from_secs(args.beacon_period), beacon)?)
        .await?;

    devices
        .register(
            scheduler,
            &publisher,
            Duration::from_secs(args.sensor_period),
            PayloadFormat::Json,
            |label| info.topic(label),
        )
        .await?;

    let gateway = tokio::spawn(serve_gateway(
        Arc::clone(&publisher),
        info.clone(),
        devices.clone(),
        inbox,
        cancellation_token,
    ));

    Ok(Link::Mqtt { publisher, gateway })
}

async fn run(args: Args) -> Result<(), BoxError> {
    let info = NodeInfo::new(args.id.as_str());
    info!("Starting node `{}` ({})", info.id, info.uid_hex());

    let devices = Devices::init().await?;

    let (scheduler, handle): (Scheduler, SchedulerHandle) = Scheduler::new(args.capacity);
    let scheduler_task = tokio::spawn(scheduler.run());

    let cancellation_token = CancellationToken::new();
    let link = match args.protocol {
        Protocol::Coap => {
            start_coap(&args, &info, &devices, &handle, cancellation_token.clone()).await
        }
        Protocol::Mqtt => {
            start_mqtt(&args, &info, &devices, &handle, cancellation_token.clone()).await
        }
    };

    // Stop the scheduler even when the node failed to start.
    let link = match link {
        Ok(link) => {
            info!("Node running with {} jobs, press Ctrl-C to stop", handle.jobs().await?.len());
            tokio::signal::ctrl_c().await?;
            Ok(link)
        }
        Err(e) => Err(e),
    };

    info!("Shutting down");
    handle.shutdown();
    cancellation_token.cancel();
    scheduler_task.await?;

    match link? {
        Link::Coap(server) => server.await?,
        Link::Mqtt { publisher, gateway } => {
            gateway.await?;
            // Jobs dropped with the scheduler released their references.
            if let Ok(publisher) = Arc::try_unwrap(publisher) {
                publisher.disconnect().await;
            }
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(if args.verbose {
            Level::DEBUG
        } else {
            Level::INFO
        })
        .init();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
