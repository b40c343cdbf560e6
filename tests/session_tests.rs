//! Session lifecycle against the loopback host
//!
//! Covers device matching, open failure cleanup, close, retries,
//! reconnect and the raw transfer helpers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use usbtmc_session::config::DEFAULT_PRODUCT_ID;
use usbtmc_session::host::{Direction, HostError, PipeInfo, TransferType};
use usbtmc_session::loopback::{Fault, LoopbackDevice, LoopbackHost, RecordingSleeper, Released};
use usbtmc_session::{matcher, Config, Connector, Error, EventType, SessionState};

const ECID: u64 = 0x0012_3456_789a;

fn connector(host: &LoopbackHost) -> (Connector<LoopbackHost, RecordingSleeper>, RecordingSleeper) {
    let sleeper = RecordingSleeper::new();
    let connector = Connector::new(host.clone(), Config::default()).with_sleeper(sleeper.clone());
    (connector, sleeper)
}

fn counter() -> (Arc<AtomicUsize>, impl FnMut(&usbtmc_session::Event<'_>) + Send + 'static) {
    let count = Arc::new(AtomicUsize::new(0));
    let inner = Arc::clone(&count);
    (count, move |_: &usbtmc_session::Event<'_>| {
        inner.fetch_add(1, Ordering::SeqCst);
    })
}

fn device_releases(host: &LoopbackHost) -> usize {
    host.released()
        .iter()
        .filter(|r| matches!(r, Released::Device { .. }))
        .count()
}

mod matching {
    use super::*;

    #[test]
    fn test_ecid_selects_matching_serial_and_releases_rejected() {
        let host = LoopbackHost::new();
        host.add_device(LoopbackDevice::new("ABC123").location(1));
        host.add_device(LoopbackDevice::new("HTG99887766").location(2));

        let service = matcher::find(&host, 0x049f, DEFAULT_PRODUCT_ID, ECID, "HTG").unwrap();

        assert_eq!(
            usbtmc_session::host::Service::serial_number(&service),
            Some("HTG99887766".to_string())
        );
        assert_eq!(
            host.released(),
            vec![Released::Service {
                serial: Some("ABC123".to_string())
            }]
        );
    }

    #[test]
    fn test_token_is_case_insensitive() {
        let host = LoopbackHost::new();
        host.add_device(LoopbackDevice::new("serial-htg-0042"));
        let (connector, _) = connector(&host);

        assert!(connector.open_with_ecid(ECID).is_ok());
    }

    #[test]
    fn test_zero_ecid_takes_first_candidate() {
        let host = LoopbackHost::new();
        host.add_device(LoopbackDevice::new("ABC123").location(1));
        host.add_device(LoopbackDevice::new("HTG99887766").location(2));
        let (connector, _) = connector(&host);

        let session = connector.open_with_ecid(0).unwrap();
        assert_eq!(session.ecid(), 0);
        drop(session);

        assert!(host.released().contains(&Released::Device { location: 1 }));
    }

    #[test]
    fn test_no_match_is_unable_to_connect() {
        let host = LoopbackHost::new();
        host.add_device(LoopbackDevice::new("ABC123"));
        host.add_device(LoopbackDevice::new("HTG1").without_serial());
        host.add_device(LoopbackDevice::new("HTG2").product(0x1234, 0x5678));
        let (connector, _) = connector(&host);

        assert_eq!(connector.open_with_ecid(ECID).unwrap_err(), Error::UnableToConnect);
        assert_eq!(
            host.released(),
            vec![
                Released::Service {
                    serial: Some("ABC123".to_string())
                },
                Released::Service { serial: None },
            ]
        );
    }

    #[test]
    fn test_enumeration_failure_is_unable_to_connect() {
        let host = LoopbackHost::new();
        host.add_device(LoopbackDevice::new("HTG1"));
        host.fail(Fault::Enumerate, HostError::NoDevice);
        let (connector, _) = connector(&host);

        assert_eq!(connector.open_with_ecid(0).unwrap_err(), Error::UnableToConnect);
    }
}

mod open {
    use super::*;

    #[test]
    fn test_open_configures_device() {
        let host = LoopbackHost::new();
        host.add_device(LoopbackDevice::new("HTG1"));
        let (connector, _) = connector(&host);

        let session = connector.open_with_ecid(ECID).unwrap();

        assert_eq!(session.state(), SessionState::Open);
        assert_eq!(session.ecid(), ECID);
        assert_eq!(session.mode(), DEFAULT_PRODUCT_ID);
        assert_eq!(session.configuration(), 1);
        assert_eq!(session.interface(), 0);
        assert_eq!(session.alt_interface(), 0);
        assert_eq!(host.configurations(), vec![1]);
        assert!(host.alt_settings().is_empty());
    }

    #[test]
    fn test_sessions_get_distinct_ids() {
        let host = LoopbackHost::new();
        host.add_device(LoopbackDevice::new("HTG1"));
        let (connector, _) = connector(&host);

        let first = connector.open_with_ecid(ECID).unwrap();
        let second = connector.open_with_ecid(ECID).unwrap();
        assert_ne!(first.id(), second.id());
    }

    #[test]
    fn test_exclusive_open_failure_releases_device() {
        let host = LoopbackHost::new();
        host.add_device(LoopbackDevice::new("HTG1").location(7));
        host.fail(Fault::OpenExclusive, HostError::Busy);
        let (connector, _) = connector(&host);

        assert_eq!(connector.open_with_ecid(ECID).unwrap_err(), Error::UnableToConnect);
        assert_eq!(host.released(), vec![Released::Device { location: 7 }]);
    }

    #[test]
    fn test_create_failure_is_unknown_error() {
        let host = LoopbackHost::new();
        host.add_device(LoopbackDevice::new("HTG1"));
        host.fail(Fault::CreateDevice, HostError::Other("plug-in".into()));
        let (connector, _) = connector(&host);

        assert_eq!(connector.open_with_ecid(ECID).unwrap_err(), Error::UnknownError);
    }

    #[test]
    fn test_configuration_failure_releases_device() {
        let host = LoopbackHost::new();
        host.add_device(LoopbackDevice::new("HTG1").location(7));
        host.fail(Fault::SetConfiguration, HostError::Busy);
        let (connector, _) = connector(&host);

        assert_eq!(connector.open_with_ecid(ECID).unwrap_err(), Error::UsbConfiguration);
        assert_eq!(host.released(), vec![Released::Device { location: 7 }]);
    }

    #[test]
    fn test_interface_failure_releases_everything() {
        let host = LoopbackHost::new();
        host.add_device(LoopbackDevice::new("HTG1").location(7));
        host.fail(Fault::OpenInterface, HostError::Busy);
        let (connector, _) = connector(&host);

        assert_eq!(connector.open_with_ecid(ECID).unwrap_err(), Error::UsbInterface);
        assert_eq!(
            host.released(),
            vec![
                Released::Interface {
                    location: 7,
                    index: 0
                },
                Released::Device { location: 7 },
            ]
        );
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let host = LoopbackHost::new();
        host.add_device(LoopbackDevice::new("HTG1"));
        let connector = Connector::new(host.clone(), Config::default().io_buffer_size(1001));

        assert_eq!(connector.open_with_ecid(ECID).unwrap_err(), Error::InvalidInput);
        assert_eq!(host.enumerations(), 0);
    }
}

mod close {
    use super::*;

    #[test]
    fn test_close_notifies_then_releases_in_order() {
        let host = LoopbackHost::new();
        host.add_device(LoopbackDevice::new("HTG1").location(3));
        let (connector, _) = connector(&host);

        let mut session = connector.open_with_ecid(ECID).unwrap();

        let observed = Arc::new(std::sync::Mutex::new(None));
        let seen = Arc::clone(&observed);
        let released_before = host.clone();
        session.event_subscribe(EventType::Disconnected, move |event| {
            *seen.lock().unwrap() = Some((event.size, released_before.released().len()));
        });

        session.close();

        // callback ran before anything was released
        assert_eq!(*observed.lock().unwrap(), Some((0, 0)));
        assert_eq!(
            host.released(),
            vec![
                Released::Interface {
                    location: 3,
                    index: 0
                },
                Released::Device { location: 3 },
            ]
        );
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn test_close_is_idempotent() {
        let host = LoopbackHost::new();
        host.add_device(LoopbackDevice::new("HTG1"));
        let (connector, _) = connector(&host);

        let mut session = connector.open_with_ecid(ECID).unwrap();
        let (disconnects, callback) = counter();
        session.event_subscribe(EventType::Disconnected, callback);

        session.close();
        session.close();
        drop(session);

        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
        assert_eq!(device_releases(&host), 1);
    }

    #[test]
    fn test_drop_closes_open_session() {
        let host = LoopbackHost::new();
        host.add_device(LoopbackDevice::new("HTG1"));
        let (connector, _) = connector(&host);

        let mut session = connector.open_with_ecid(ECID).unwrap();
        let (disconnects, callback) = counter();
        session.event_subscribe(EventType::Disconnected, callback);
        drop(session);

        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
        assert_eq!(device_releases(&host), 1);
    }

    #[test]
    fn test_closed_session_rejects_operations() {
        let host = LoopbackHost::new();
        host.add_device(LoopbackDevice::new("HTG1"));
        let (connector, _) = connector(&host);

        let mut session = connector.open_with_ecid(ECID).unwrap();
        session.close();

        let mut buf = [0_u8; 8];
        assert_eq!(session.reset(), Err(Error::NoDevice));
        assert_eq!(session.set_configuration(1), Err(Error::NoDevice));
        assert_eq!(session.set_interface(0, 0), Err(Error::NoDevice));
        assert_eq!(
            session.control_transfer(0xc0, 0, 0, 0, &mut buf, Duration::from_secs(1)),
            Err(Error::NoDevice)
        );
        assert_eq!(
            session.bulk_transfer(0x81, &mut buf, Duration::from_secs(1)),
            Err(Error::NoDevice)
        );
    }
}

mod retry {
    use super::*;

    #[test]
    fn test_attempts_exhausted() {
        let host = LoopbackHost::new();
        let (connector, sleeper) = connector(&host);

        assert_eq!(
            connector.open_with_ecid_and_attempts(ECID, 3).unwrap_err(),
            Error::UnableToConnect
        );
        assert_eq!(host.enumerations(), 3);
        assert_eq!(sleeper.sleeps(), vec![Duration::from_secs(1); 3]);
    }

    #[test]
    fn test_device_showing_up_late() {
        let host = LoopbackHost::new();
        host.add_device(LoopbackDevice::new("HTG1").appears_after(2));
        let (connector, sleeper) = connector(&host);

        let session = connector.open_with_ecid_and_attempts(ECID, 5).unwrap();

        assert!(session.is_open());
        assert_eq!(host.enumerations(), 3);
        assert_eq!(sleeper.sleeps().len(), 2);
    }

    #[test]
    fn test_zero_attempts() {
        let host = LoopbackHost::new();
        host.add_device(LoopbackDevice::new("HTG1"));
        let (connector, sleeper) = connector(&host);

        assert_eq!(
            connector.open_with_ecid_and_attempts(ECID, 0).unwrap_err(),
            Error::UnableToConnect
        );
        assert_eq!(host.enumerations(), 0);
        assert!(sleeper.sleeps().is_empty());
    }
}

mod reconnect {
    use super::*;

    #[test]
    fn test_reconnect_reopens_same_ecid_and_keeps_progress() {
        let host = LoopbackHost::new();
        host.add_device(LoopbackDevice::new("ABC123").location(1));
        host.add_device(LoopbackDevice::new("HTG42").location(2));
        let (connector, sleeper) = connector(&host);

        let mut session = connector.open_with_ecid(ECID).unwrap();
        let old_id = session.id();

        let (progress, on_progress) = counter();
        let (received, on_received) = counter();
        let (disconnects, on_disconnect) = counter();
        session.event_subscribe(EventType::Progress, on_progress);
        session.event_subscribe(EventType::Received, on_received);
        session.event_subscribe(EventType::Disconnected, on_disconnect);

        let mut session = connector
            .reconnect(session, Duration::from_secs(2))
            .expect("device should come back");

        assert_ne!(session.id(), old_id);
        assert_eq!(session.ecid(), ECID);
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
        assert_eq!(sleeper.sleeps(), vec![Duration::from_secs(2)]);

        // ECID filtering ran again and skipped the other device
        let rejected = host
            .released()
            .iter()
            .filter(|r| {
                **r == Released::Service {
                    serial: Some("ABC123".to_string()),
                }
            })
            .count();
        assert_eq!(rejected, 2);

        assert!(session.event_unsubscribe(EventType::Received).is_none());
        session.usbtmc_write(b"*RST").unwrap();
        assert_eq!(progress.load(Ordering::SeqCst), 1);
        assert_eq!(received.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_reconnect_without_pause() {
        let host = LoopbackHost::new();
        host.add_device(LoopbackDevice::new("HTG42"));
        let (connector, sleeper) = connector(&host);

        let session = connector.open_with_ecid(ECID).unwrap();
        let session = connector.reconnect(session, Duration::ZERO);

        assert!(session.is_some());
        assert!(sleeper.sleeps().is_empty());
    }

    #[test]
    fn test_reconnect_gives_up_after_ten_attempts() {
        let host = LoopbackHost::new();
        host.add_device(LoopbackDevice::new("HTG42"));
        let (connector, sleeper) = connector(&host);

        let session = connector.open_with_ecid(ECID).unwrap();
        host.fail(Fault::Enumerate, HostError::NoDevice);

        assert!(connector.reconnect(session, Duration::from_secs(3)).is_none());

        let sleeps = sleeper.sleeps();
        assert_eq!(sleeps.len(), 11);
        assert_eq!(sleeps[0], Duration::from_secs(3));
        assert!(sleeps[1..].iter().all(|d| *d == Duration::from_secs(1)));
        assert_eq!(host.enumerations(), 11);
        assert_eq!(device_releases(&host), 1);
    }
}

mod usb {
    use super::*;

    #[test]
    fn test_reset_tolerates_unresponsive_device() {
        let host = LoopbackHost::new();
        host.add_device(LoopbackDevice::new("HTG1"));
        let (connector, _) = connector(&host);
        let mut session = connector.open_with_ecid(ECID).unwrap();

        assert_eq!(session.reset(), Ok(()));
        assert_eq!(host.resets(), 1);

        host.fail_once(Fault::Reset, HostError::NotResponding);
        assert_eq!(session.reset(), Ok(()));

        host.fail_once(Fault::Reset, HostError::Busy);
        assert_eq!(session.reset(), Err(Error::UnknownError));
    }

    #[test]
    fn test_set_interface_replaces_previous() {
        let host = LoopbackHost::new();
        host.add_device(LoopbackDevice::new("HTG1").location(5));
        let (connector, _) = connector(&host);
        let mut session = connector.open_with_ecid(ECID).unwrap();

        session.set_interface(1, 2).unwrap();

        assert_eq!(session.interface(), 1);
        assert_eq!(session.alt_interface(), 2);
        assert_eq!(host.alt_settings(), vec![(1, 2)]);
        assert_eq!(
            host.released(),
            vec![Released::Interface {
                location: 5,
                index: 0
            }]
        );

        // alternate setting only applies to interface 1
        session.set_interface(0, 4).unwrap();
        assert_eq!(host.alt_settings(), vec![(1, 2)]);
    }

    #[test]
    fn test_set_interface_failures() {
        let host = LoopbackHost::new();
        host.add_device(LoopbackDevice::new("HTG1"));
        let (connector, _) = connector(&host);
        let mut session = connector.open_with_ecid(ECID).unwrap();

        assert_eq!(session.set_interface(9, 0), Err(Error::UsbInterface));

        host.fail_once(Fault::AlternateSetting, HostError::Busy);
        assert_eq!(session.set_interface(1, 1), Err(Error::UsbInterface));

        // without a claimed interface bulk transfers have nowhere to go
        let mut buf = [0_u8; 4];
        assert_eq!(
            session.bulk_transfer(0x04, &mut buf, Duration::from_secs(1)),
            Err(Error::UsbInterface)
        );
    }

    #[test]
    fn test_set_configuration_failure() {
        let host = LoopbackHost::new();
        host.add_device(LoopbackDevice::new("HTG1"));
        let (connector, _) = connector(&host);
        let mut session = connector.open_with_ecid(ECID).unwrap();

        host.fail_once(Fault::SetConfiguration, HostError::Busy);
        assert_eq!(session.set_configuration(2), Err(Error::UsbConfiguration));
        assert_eq!(session.configuration(), 1);

        session.set_configuration(2).unwrap();
        assert_eq!(session.configuration(), 2);
    }

    #[test]
    fn test_control_transfer() {
        let host = LoopbackHost::new();
        host.add_device(LoopbackDevice::new("HTG1"));
        let (connector, _) = connector(&host);
        let mut session = connector.open_with_ecid(ECID).unwrap();

        let mut buf = [0xff_u8; 3];
        let n = session
            .control_transfer(0xa1, 0x07, 0x0201, 0x0004, &mut buf, Duration::from_secs(10))
            .unwrap();

        assert_eq!(n, 3);
        let requests = host.control_requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(
            requests[0].setup_packet(),
            [0xa1, 0x07, 0x01, 0x02, 0x04, 0x00, 0x03, 0x00]
        );

        for (host_error, expected) in [
            (HostError::Timeout, Error::Timeout),
            (HostError::TransactionTimeout, Error::Timeout),
            (HostError::NotResponding, Error::NoDevice),
            (HostError::NoDevice, Error::NoDevice),
            (HostError::Busy, Error::UnknownError),
        ] {
            host.fail_once(Fault::Control, host_error);
            assert_eq!(
                session.control_transfer(0x21, 0x01, 0, 0, &mut buf, Duration::from_secs(1)),
                Err(expected)
            );
        }
    }

    #[test]
    fn test_bulk_transfer_pipe_resolution() {
        let host = LoopbackHost::new();
        host.add_device(LoopbackDevice::new("HTG1").pipes(vec![
            PipeInfo {
                direction: Direction::Out,
                number: 6,
                transfer_type: TransferType::Bulk,
                max_packet_size: 64,
                interval: 0,
            },
            PipeInfo {
                direction: Direction::In,
                number: 2,
                transfer_type: TransferType::Interrupt,
                max_packet_size: 8,
                interval: 4,
            },
        ]));
        let (connector, _) = connector(&host);
        let mut session = connector.open_with_ecid(ECID).unwrap();

        let mut data = [1_u8, 2, 3, 4];
        assert_eq!(session.bulk_transfer(0x04, &mut data, Duration::from_secs(1)), Ok(4));
        assert_eq!(host.transfers()[0].pipe, 1);

        // only an interrupt pipe flows in
        assert_eq!(
            session.bulk_transfer(0x81, &mut data, Duration::from_secs(1)),
            Err(Error::UsbInterface)
        );
    }

    #[test]
    fn test_bulk_transfer_status_and_pipe_errors() {
        let host = LoopbackHost::new();
        host.add_device(LoopbackDevice::new("HTG1"));
        let (connector, _) = connector(&host);
        let mut session = connector.open_with_ecid(ECID).unwrap();
        let mut data = [0_u8; 4];
        let timeout = Duration::from_secs(1);

        host.fail_once(Fault::PipeStatus, HostError::NotOpen);
        assert_eq!(session.bulk_transfer(0x04, &mut data, timeout), Err(Error::UnableToConnect));

        host.fail_once(Fault::PipeStatus, HostError::NoDevice);
        assert_eq!(session.bulk_transfer(0x04, &mut data, timeout), Err(Error::NoDevice));

        host.fail_once(Fault::PipeStatus, HostError::Busy);
        assert_eq!(session.bulk_transfer(0x04, &mut data, timeout), Err(Error::UsbStatus));

        host.fail_once(Fault::Pipes, HostError::Busy);
        assert_eq!(session.bulk_transfer(0x04, &mut data, timeout), Err(Error::UsbInterface));

        host.fail_once(Fault::Write, HostError::Timeout);
        assert_eq!(session.bulk_transfer(0x04, &mut data, timeout), Err(Error::Pipe));

        // nothing queued on the IN side
        assert_eq!(session.bulk_transfer(0x81, &mut data, timeout), Err(Error::Pipe));
    }
}
