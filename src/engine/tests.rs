use std::collections::HashSet;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::AtomicBool;

use chrono::Utc;
use pretty_assertions::assert_eq;
use serenity::async_trait;

use super::*;
use crate::access::DbAgeVerifier;
use crate::database::models::AgeVerification;
use crate::error::DenyReason;
use crate::queue::tests::track;
use crate::session::SessionType;
use crate::voice::{VoiceEventSender, VoiceLink};

fn guild() -> GuildId {
    GuildId::new(1)
}
fn voice() -> ChannelId {
    ChannelId::new(10)
}
fn text() -> ChannelId {
    ChannelId::new(11)
}
fn owner() -> UserId {
    UserId::new(100)
}
fn other() -> UserId {
    UserId::new(200)
}
fn third() -> UserId {
    UserId::new(300)
}

#[derive(Default)]
struct VoiceLog {
    connects: usize,
    plays: Vec<(AudioSource, u8, u64)>,
    stops: usize,
    destroys: usize,
    live_links: usize,
    max_live_links: usize,
}

#[derive(Default)]
struct FakeTransport {
    log: Arc<StdMutex<VoiceLog>>,
    senders: StdMutex<Vec<VoiceEventSender>>,
    fail_connect: AtomicBool,
    fail_play: Arc<AtomicBool>,
}

impl FakeTransport {
    fn log(&self) -> std::sync::MutexGuard<'_, VoiceLog> {
        self.log.lock().unwrap()
    }

    fn last_generation(&self) -> u64 {
        self.log().plays.last().map(|p| p.2).expect("nothing played yet")
    }

    fn sender(&self, n: usize) -> VoiceEventSender {
        self.senders.lock().unwrap()[n].clone()
    }
}

#[async_trait]
impl VoiceTransport for FakeTransport {
    async fn connect(
        &self,
        _guild_id: GuildId,
        _channel_id: ChannelId,
        events: VoiceEventSender,
    ) -> MusicResult<Box<dyn VoiceLink>> {
        // Long enough for a competing join to queue up behind the guild lock.
        tokio::time::sleep(Duration::from_millis(20)).await;
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(MusicError::Voice("handshake timed out".into()));
        }
        {
            let mut log = self.log();
            log.connects += 1;
            log.live_links += 1;
            log.max_live_links = log.max_live_links.max(log.live_links);
        }
        self.senders.lock().unwrap().push(events);
        Ok(Box::new(FakeLink {
            log: self.log.clone(),
            fail_play: self.fail_play.clone(),
            destroyed: false,
        }))
    }
}

struct FakeLink {
    log: Arc<StdMutex<VoiceLog>>,
    fail_play: Arc<AtomicBool>,
    destroyed: bool,
}

#[async_trait]
impl VoiceLink for FakeLink {
    async fn play(&mut self, source: &AudioSource, volume: u8, generation: u64) -> MusicResult<()> {
        if self.fail_play.load(Ordering::SeqCst) {
            return Err(MusicError::Voice("encoder refused the stream".into()));
        }
        self.log
            .lock()
            .unwrap()
            .plays
            .push((source.clone(), volume, generation));
        Ok(())
    }

    fn pause(&mut self) -> bool {
        true
    }

    fn unpause(&mut self) -> bool {
        true
    }

    fn stop(&mut self) {
        self.log.lock().unwrap().stops += 1;
    }

    fn set_volume(&mut self, _volume: u8) -> bool {
        true
    }

    async fn destroy(&mut self) {
        if !self.destroyed {
            self.destroyed = true;
            let mut log = self.log.lock().unwrap();
            log.destroys += 1;
            log.live_links -= 1;
        }
    }
}

/// Resolves `.../<title>` or a bare title. Titles starting with `sc-` come
/// from soundcloud.
#[derive(Default)]
struct FakeResolver {
    broken: StdMutex<HashSet<String>>,
}

impl FakeResolver {
    fn break_title(&self, title: &str) {
        self.broken.lock().unwrap().insert(title.to_string());
    }
}

#[async_trait]
impl TrackResolver for FakeResolver {
    async fn resolve(&self, query: &str) -> MusicResult<ResolvedTrack> {
        let title = query.rsplit('/').next().unwrap_or(query).to_string();
        if self.broken.lock().unwrap().contains(&title) {
            return Err(MusicError::Unplayable(title));
        }
        let source = if title.starts_with("sc-") {
            "soundcloud"
        } else {
            "youtube"
        };
        Ok(ResolvedTrack {
            source: AudioSource::Http(format!("https://audio.test/{title}")),
            info: TrackInfo {
                url: format!("https://example.test/{title}"),
                title,
                duration_secs: Some(60),
                thumbnail: None,
                author: None,
                source: source.to_string(),
            },
        })
    }
}

struct Harness {
    service: MusicService,
    transport: Arc<FakeTransport>,
    resolver: Arc<FakeResolver>,
    db: Database,
}

fn harness_with(config: MusicConfig) -> Harness {
    let db = Database::open_in_memory().unwrap();
    let transport = Arc::new(FakeTransport::default());
    let resolver = Arc::new(FakeResolver::default());
    let service = MusicService::new(
        db.clone(),
        Arc::new(DbAgeVerifier::new(db.clone())),
        transport.clone(),
        resolver.clone(),
        config,
    );
    Harness {
        service,
        transport,
        resolver,
        db,
    }
}

fn harness() -> Harness {
    harness_with(MusicConfig {
        idle_disconnect: None,
        ..MusicConfig::default()
    })
}

impl Harness {
    async fn join(&self) -> MusicSession {
        self.service
            .join(guild(), voice(), text(), owner(), SessionOptions::default())
            .await
            .unwrap()
    }

    async fn play(&self, query: &str, user: UserId) -> MusicResult<PlayOutcome> {
        self.service.play(guild(), TrackRequest::new(query, user)).await
    }

    async fn end_current(&self) {
        let generation = self.transport.last_generation();
        self.service
            .handle_voice_event(guild(), VoiceEvent::TrackEnded { generation })
            .await
            .unwrap();
    }

    async fn current_title(&self) -> Option<String> {
        self.service
            .status(guild())
            .await
            .unwrap()
            .current
            .map(|c| c.info.title)
    }

    fn last_end_reason(&self) -> Option<String> {
        self.service
            .sessions()
            .recent_sessions(guild(), 1)
            .unwrap()
            .first()
            .and_then(|s| s.parsed_metadata().end_reason)
    }

    fn verify(&self, user: UserId) {
        self.db
            .with_conn(|conn| {
                AgeVerification::upsert(
                    conn,
                    &AgeVerification {
                        user_id: user.to_string(),
                        guild_id: guild().to_string(),
                        is_21_plus: true,
                        status: "verified".into(),
                        verified_at: Some(Utc::now().naive_utc()),
                        expires_at: None,
                    },
                )
            })
            .unwrap();
        self.service.access().invalidate(user, guild());
    }
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn concurrent_joins_open_exactly_one_session() {
    let h = harness();
    let first = h
        .service
        .join(guild(), voice(), text(), owner(), SessionOptions::default());
    let second = h
        .service
        .join(guild(), voice(), text(), other(), SessionOptions::default());
    let (a, b) = futures_util::future::join(first, second).await;

    assert_eq!([a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count(), 1);
    assert!(matches!(a.err().or(b.err()), Some(MusicError::AlreadyActive)));
    {
        let log = h.transport.log();
        assert_eq!(log.connects, 1);
        assert_eq!(log.max_live_links, 1);
    }
    assert_eq!(
        h.service.sessions().recent_sessions(guild(), 10).unwrap().len(),
        1
    );
}

#[tokio::test]
async fn failed_connect_ends_the_session_and_keeps_nothing() {
    let h = harness();
    h.transport.fail_connect.store(true, Ordering::SeqCst);

    let err = h
        .service
        .join(guild(), voice(), text(), owner(), SessionOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, MusicError::Voice(_)));
    assert!(h.service.sessions().get_active_session(guild()).unwrap().is_none());
    assert_eq!(h.last_end_reason().as_deref(), Some(END_CONNECT_FAILED));
    assert!(matches!(
        h.service.status(guild()).await,
        Err(MusicError::NoSession)
    ));

    h.transport.fail_connect.store(false, Ordering::SeqCst);
    h.join().await;
}

#[tokio::test]
async fn cannabis_sessions_need_verification() {
    let h = harness();
    let options = SessionOptions {
        session_type: SessionType::Meditation,
        cannabis_content: false,
    };

    let err = h
        .service
        .join(guild(), voice(), text(), owner(), options)
        .await
        .unwrap_err();
    assert!(matches!(err, MusicError::AccessDenied(DenyReason::NotFound)));
    assert_eq!(h.transport.log().connects, 0);
    assert!(h.service.sessions().get_active_session(guild()).unwrap().is_none());

    h.verify(owner());
    let session = h
        .service
        .join(guild(), voice(), text(), owner(), options)
        .await
        .unwrap();
    assert!(session.requires_21_plus);
}

#[tokio::test]
async fn unverified_cannabis_track_changes_nothing() {
    let h = harness();
    h.join().await;
    h.play("a", owner()).await.unwrap();

    let err = h
        .service
        .play(guild(), TrackRequest::new("kush-cuts", other()).cannabis(true))
        .await
        .unwrap_err();
    assert!(matches!(err, MusicError::AccessDenied(DenyReason::NotFound)));
    assert_eq!(err.code(), "verification_not_found");

    let status = h.service.status(guild()).await.unwrap();
    assert_eq!(status.current.map(|c| c.info.title).as_deref(), Some("a"));
    assert_eq!(status.stats.total_tracks, 1);
    assert_eq!(h.transport.log().plays.len(), 1);
}

#[tokio::test]
async fn verified_members_may_queue_cannabis_tracks() {
    let h = harness();
    h.join().await;
    h.play("a", owner()).await.unwrap();
    h.verify(other());

    let outcome = h
        .service
        .play(guild(), TrackRequest::new("kush-cuts", other()).cannabis(true))
        .await
        .unwrap();
    assert!(matches!(outcome, PlayOutcome::Queued { position: 2, .. }));
    let upcoming = h.service.status(guild()).await.unwrap().upcoming;
    assert!(upcoming[0].is_cannabis_content);
}

#[tokio::test]
async fn play_starts_then_queues() {
    let h = harness();
    assert!(matches!(
        h.play("a", owner()).await,
        Err(MusicError::NoSession)
    ));
    let session = h.join().await;

    let started = h.play("a", owner()).await.unwrap();
    match started {
        PlayOutcome::Started { track } => {
            assert_eq!(track.info.title, "a");
            assert_eq!(track.requested_by, owner().to_string());
        }
        unexpected => panic!("expected a start, got {unexpected:?}"),
    }
    assert_eq!(
        h.play("b", other()).await.unwrap(),
        PlayOutcome::Queued {
            position: 2,
            title: "b".into(),
            ahead: 0,
        }
    );

    let status = h.service.status(guild()).await.unwrap();
    assert!(status.is_playing);
    assert_eq!(status.session.id, session.id);
    assert_eq!(status.session.current_track_index, 1);
    assert_eq!(status.stats.played_tracks, 1);
    assert_eq!(status.stats.unplayed_tracks, 1);
    // the live track was persisted as history, not as a pending entry
    assert_eq!(h.service.queue().history(session.id, 10).unwrap()[0].title, "a");
}

#[tokio::test]
async fn finished_tracks_advance_through_the_queue() {
    let h = harness();
    let session = h.join().await;
    let a = h.service.queue().enqueue(session.id, &track("a", 60)).unwrap();
    let b = h.service.queue().enqueue(session.id, &track("b", 60)).unwrap();

    let outcome = h
        .service
        .play(guild(), TrackRequest::from_entry(&a, owner()))
        .await
        .unwrap();
    assert!(matches!(outcome, PlayOutcome::Started { ref track } if track.entry_id == a.id));

    h.end_current().await;
    assert_eq!(h.current_title().await.as_deref(), Some("b"));
    assert!(h.service.queue().get(a.id).unwrap().unwrap().played_at.is_some());

    h.end_current().await;
    let status = h.service.status(guild()).await.unwrap();
    assert_eq!(status.current, None);
    assert_eq!(status.state, EngineState::Stopped);
    assert_eq!(status.session.current_track_index, 2);
    assert!(h.service.queue().get(b.id).unwrap().unwrap().played_at.is_some());
    assert_eq!(h.transport.log().destroys, 0);
}

#[tokio::test]
async fn stale_track_events_are_ignored() {
    let h = harness();
    h.join().await;
    h.play("a", owner()).await.unwrap();
    h.play("b", owner()).await.unwrap();
    let first = h.transport.last_generation();

    h.service
        .handle_voice_event(guild(), VoiceEvent::TrackEnded { generation: first + 1000 })
        .await
        .unwrap();
    assert_eq!(h.current_title().await.as_deref(), Some("a"));

    h.end_current().await;
    assert_eq!(h.current_title().await.as_deref(), Some("b"));

    h.service
        .handle_voice_event(
            guild(),
            VoiceEvent::TrackErrored {
                generation: first,
                error: "late".into(),
            },
        )
        .await
        .unwrap();
    assert_eq!(h.current_title().await.as_deref(), Some("b"));
}

#[tokio::test]
async fn unplayable_queue_entries_are_skipped() {
    let h = harness();
    h.join().await;
    h.play("a", owner()).await.unwrap();
    h.play("b", owner()).await.unwrap();
    h.play("c", owner()).await.unwrap();
    h.resolver.break_title("b");

    h.end_current().await;

    let status = h.service.status(guild()).await.unwrap();
    assert_eq!(status.current.map(|c| c.info.title).as_deref(), Some("c"));
    assert_eq!(status.stats.played_tracks, 3);
    assert_eq!(status.stats.unplayed_tracks, 0);
}

#[tokio::test]
async fn failed_start_leaves_state_untouched() {
    let h = harness();
    h.join().await;
    h.transport.fail_play.store(true, Ordering::SeqCst);

    assert!(matches!(
        h.play("a", owner()).await,
        Err(MusicError::Voice(_))
    ));
    let status = h.service.status(guild()).await.unwrap();
    assert_eq!(status.current, None);
    assert_eq!(status.stats.total_tracks, 0);
    assert_eq!(status.session.current_track_index, 0);

    h.transport.fail_play.store(false, Ordering::SeqCst);
    assert!(matches!(
        h.play("a", owner()).await.unwrap(),
        PlayOutcome::Started { .. }
    ));
}

#[tokio::test]
async fn requester_skips_immediately() {
    let h = harness();
    h.join().await;
    h.play("a", owner()).await.unwrap();
    h.play("b", other()).await.unwrap();

    let outcome = h.service.skip(guild(), owner()).await.unwrap();
    match outcome {
        SkipOutcome::Skipped { track, next } => {
            assert_eq!(track.title, "a");
            assert_eq!(next.map(|n| n.title).as_deref(), Some("b"));
        }
        unexpected => panic!("expected a skip, got {unexpected:?}"),
    }
    assert_eq!(h.current_title().await.as_deref(), Some("b"));
}

#[tokio::test]
async fn other_members_vote_to_skip() {
    let h = harness_with(MusicConfig {
        skip_votes: 2,
        idle_disconnect: None,
        ..MusicConfig::default()
    });
    h.join().await;
    h.play("a", owner()).await.unwrap();
    let stops = h.transport.log().stops;

    assert_eq!(
        h.service.skip(guild(), other()).await.unwrap(),
        SkipOutcome::VoteRegistered {
            votes: 1,
            required: 2
        }
    );
    // voting twice doesn't count twice
    assert_eq!(
        h.service.skip(guild(), other()).await.unwrap(),
        SkipOutcome::VoteRegistered {
            votes: 1,
            required: 2
        }
    );
    let status = h.service.status(guild()).await.unwrap();
    assert!(status.is_playing);
    assert_eq!(status.skip_votes, 1);
    assert_eq!(h.transport.log().stops, stops);

    let outcome = h.service.skip(guild(), third()).await.unwrap();
    assert!(matches!(outcome, SkipOutcome::Skipped { next: None, .. }));
    assert_eq!(h.current_title().await, None);
    assert_eq!(h.transport.log().stops, stops + 1);
}

#[tokio::test]
async fn skip_needs_something_playing() {
    let h = harness();
    assert!(matches!(
        h.service.skip(guild(), owner()).await,
        Err(MusicError::NoSession)
    ));
    h.join().await;
    assert!(matches!(
        h.service.skip(guild(), owner()).await,
        Err(MusicError::NotPlaying)
    ));
}

#[tokio::test]
async fn volume_bounds_are_enforced() {
    let h = harness();
    h.join().await;

    for bad in [-5, 150] {
        assert!(matches!(
            h.service.set_volume(guild(), bad).await,
            Err(MusicError::InvalidVolume(v)) if v == bad
        ));
    }
    assert_eq!(h.service.status(guild()).await.unwrap().session.volume, 50);

    assert_eq!(
        h.service.set_volume(guild(), 0).await.unwrap(),
        VolumeChange {
            level: 0,
            applied_live: false
        }
    );
    h.play("a", owner()).await.unwrap();
    assert_eq!(
        h.service.set_volume(guild(), 100).await.unwrap(),
        VolumeChange {
            level: 100,
            applied_live: true
        }
    );
    let status = h.service.status(guild()).await.unwrap();
    assert_eq!((status.volume, status.session.volume), (100, 100));

    // the stored level is what the next track starts with
    h.play("b", owner()).await.unwrap();
    h.end_current().await;
    assert_eq!(h.transport.log().plays.last().map(|p| p.1), Some(100));
}

#[tokio::test]
async fn pause_and_resume_only_flip_when_they_apply() {
    let h = harness();
    assert!(!h.service.pause(guild()).await.unwrap());
    h.join().await;
    assert!(!h.service.pause(guild()).await.unwrap());

    h.play("a", owner()).await.unwrap();
    assert!(!h.service.resume(guild()).await.unwrap());
    assert!(h.service.pause(guild()).await.unwrap());
    assert!(!h.service.pause(guild()).await.unwrap());

    let status = h.service.status(guild()).await.unwrap();
    assert!(status.is_paused && !status.is_playing);
    assert_eq!(status.session.status, "paused");

    assert!(h.service.resume(guild()).await.unwrap());
    assert_eq!(
        h.service.status(guild()).await.unwrap().session.status,
        "active"
    );
}

#[tokio::test]
async fn loop_track_replays_until_skipped() {
    let h = harness();
    h.join().await;
    h.service.set_loop_mode(guild(), LoopMode::Track).await.unwrap();
    h.play("a", owner()).await.unwrap();

    h.end_current().await;
    let status = h.service.status(guild()).await.unwrap();
    assert_eq!(status.current.map(|c| c.info.title).as_deref(), Some("a"));
    assert_eq!(status.stats.played_tracks, 2);
    assert_eq!(status.session.parsed_metadata().loop_mode, LoopMode::Track);

    let outcome = h.service.skip(guild(), owner()).await.unwrap();
    assert!(matches!(outcome, SkipOutcome::Skipped { next: None, .. }));
}

#[tokio::test]
async fn loop_queue_requeues_finished_tracks() {
    let h = harness();
    h.join().await;
    h.service.set_loop_mode(guild(), LoopMode::Queue).await.unwrap();
    h.play("a", owner()).await.unwrap();
    h.play("b", owner()).await.unwrap();

    h.end_current().await;
    assert_eq!(h.current_title().await.as_deref(), Some("b"));
    let upcoming = h.service.status(guild()).await.unwrap().upcoming;
    assert_eq!(upcoming.iter().map(|e| e.title.as_str()).collect::<Vec<_>>(), vec!["a"]);

    h.end_current().await;
    assert_eq!(h.current_title().await.as_deref(), Some("a"));
}

#[tokio::test]
async fn blocked_sources_are_refused() {
    let h = harness();
    h.join().await;
    h.service
        .preferences()
        .set_blocked_sources(other(), guild(), &["SoundCloud".to_string()])
        .unwrap();

    assert!(matches!(
        h.play("sc-mix", other()).await,
        Err(MusicError::SourceBlocked(source)) if source == "soundcloud"
    ));
    assert!(h.play("sc-mix", owner()).await.is_ok());
}

#[tokio::test]
async fn queue_has_a_ceiling() {
    let h = harness_with(MusicConfig {
        max_queue: 1,
        idle_disconnect: None,
        ..MusicConfig::default()
    });
    h.join().await;
    h.play("a", owner()).await.unwrap();
    h.play("b", owner()).await.unwrap();
    assert!(matches!(
        h.play("c", owner()).await,
        Err(MusicError::QueueFull(1))
    ));
}

#[tokio::test]
async fn queue_operations_go_through_the_live_session() {
    let h = harness();
    assert!(matches!(
        h.service.shuffle(guild()).await,
        Err(MusicError::NoSession)
    ));
    h.join().await;
    h.play("a", owner()).await.unwrap();
    for t in ["b", "c", "d"] {
        h.play(t, owner()).await.unwrap();
    }

    assert!(h.service.shuffle(guild()).await.unwrap());
    assert!(h.service.status(guild()).await.unwrap().session.parsed_metadata().shuffle);

    h.service.remove(guild(), 3).await.unwrap();
    assert!(matches!(
        h.service.remove(guild(), 3).await,
        Err(MusicError::EntryNotFound(3))
    ));
    assert!(matches!(
        h.service.clear(guild(), false).await,
        Err(MusicError::ConfirmationRequired)
    ));
    assert_eq!(h.service.clear(guild(), true).await.unwrap(), 2);
    assert_eq!(h.current_title().await.as_deref(), Some("a"));
}

#[tokio::test]
async fn leave_is_idempotent() {
    let h = harness();
    h.join().await;
    h.play("a", owner()).await.unwrap();

    assert!(h.service.leave(guild(), "stop").await.unwrap());
    assert!(!h.service.leave(guild(), "stop").await.unwrap());

    {
        let log = h.transport.log();
        assert_eq!(log.destroys, 1);
        assert_eq!(log.live_links, 0);
    }
    assert!(matches!(
        h.service.status(guild()).await,
        Err(MusicError::NoSession)
    ));
    assert_eq!(h.last_end_reason().as_deref(), Some("stop"));
    // never joined at all
    assert!(!h.service.leave(GuildId::new(99), "stop").await.unwrap());
}

#[tokio::test]
async fn voice_disconnect_ends_the_session() {
    let h = harness();
    h.join().await;
    h.play("a", owner()).await.unwrap();

    h.service
        .handle_voice_event(guild(), VoiceEvent::Disconnected)
        .await
        .unwrap();

    assert!(matches!(
        h.service.status(guild()).await,
        Err(MusicError::NoSession)
    ));
    assert_eq!(h.last_end_reason().as_deref(), Some(END_VOICE_DISCONNECT));
    assert_eq!(h.transport.log().destroys, 1);
}

#[tokio::test]
async fn transport_events_reach_the_engine() {
    let h = harness();
    h.join().await;
    h.play("a", owner()).await.unwrap();
    h.play("b", owner()).await.unwrap();

    let generation = h.transport.last_generation();
    h.transport
        .sender(0)
        .send(VoiceEvent::TrackEnded { generation })
        .unwrap();

    eventually("auto-advance", || h.transport.log().plays.len() == 2).await;
    assert_eq!(h.current_title().await.as_deref(), Some("b"));
}

#[tokio::test]
async fn events_from_a_retired_link_are_dropped() {
    let h = harness();
    h.join().await;
    h.service.leave(guild(), "stop").await.unwrap();
    h.join().await;

    h.transport.sender(0).send(VoiceEvent::Disconnected).unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(h.service.status(guild()).await.is_ok());

    h.transport.sender(1).send(VoiceEvent::Disconnected).unwrap();
    eventually("disconnect", || h.transport.log().live_links == 0).await;
    assert_eq!(h.last_end_reason().as_deref(), Some(END_VOICE_DISCONNECT));
}

#[tokio::test]
async fn idle_sessions_disconnect() {
    let h = harness_with(MusicConfig {
        idle_disconnect: Some(Duration::from_millis(40)),
        ..MusicConfig::default()
    });
    h.join().await;
    h.play("a", owner()).await.unwrap();
    h.end_current().await;

    eventually("idle disconnect", || h.transport.log().destroys == 1).await;
    assert!(matches!(
        h.service.status(guild()).await,
        Err(MusicError::NoSession)
    ));
    assert_eq!(h.last_end_reason().as_deref(), Some(END_IDLE_TIMEOUT));
}

#[tokio::test]
async fn playing_cancels_the_idle_timer() {
    let h = harness_with(MusicConfig {
        idle_disconnect: Some(Duration::from_millis(40)),
        ..MusicConfig::default()
    });
    h.join().await;
    h.play("a", owner()).await.unwrap();

    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(h.current_title().await.as_deref(), Some("a"));
    assert_eq!(h.transport.log().destroys, 0);
}

#[tokio::test]
async fn orphaned_rows_do_not_block_a_join() {
    let h = harness();
    h.service
        .sessions()
        .create_session(
            guild(),
            voice(),
            text(),
            owner(),
            &SessionOptions::default(),
            50,
        )
        .unwrap();

    h.join().await;
    let recent = h.service.sessions().recent_sessions(guild(), 10).unwrap();
    assert_eq!(recent.len(), 2);
    assert_eq!(
        recent[1].parsed_metadata().end_reason.as_deref(),
        Some(END_ORPHANED)
    );
}

#[tokio::test]
async fn shutdown_leaves_every_guild() {
    let h = harness();
    h.join().await;
    h.service
        .join(
            GuildId::new(2),
            voice(),
            text(),
            owner(),
            SessionOptions::default(),
        )
        .await
        .unwrap();

    h.service.shutdown().await;

    assert_eq!(h.transport.log().destroys, 2);
    assert!(h.service.sessions().get_active_session(guild()).unwrap().is_none());
    assert!(h
        .service
        .sessions()
        .get_active_session(GuildId::new(2))
        .unwrap()
        .is_none());
}

fn slot_count(h: &Harness) -> usize {
    h.service.inner.slots.lock().unwrap().len()
}

#[tokio::test]
async fn skipping_a_paused_track_reactivates_the_session() {
    let h = harness();
    h.join().await;
    h.play("a", owner()).await.unwrap();
    h.play("b", owner()).await.unwrap();
    assert!(h.service.pause(guild()).await.unwrap());

    h.service.skip(guild(), owner()).await.unwrap();
    let status = h.service.status(guild()).await.unwrap();
    assert_eq!(status.current.map(|c| c.info.title).as_deref(), Some("b"));
    assert!(status.is_playing);
    assert_eq!(status.session.status, "active");

    // same when nothing is left to play
    assert!(h.service.pause(guild()).await.unwrap());
    h.service.skip(guild(), owner()).await.unwrap();
    let status = h.service.status(guild()).await.unwrap();
    assert_eq!(status.state, EngineState::Stopped);
    assert_eq!(status.session.status, "active");
}

#[tokio::test]
async fn disconnect_queued_behind_a_join_is_dropped() {
    let h = harness();
    let joining = h
        .service
        .join(guild(), voice(), text(), owner(), SessionOptions::default());
    let late_disconnect = async {
        tokio::time::sleep(Duration::from_millis(5)).await;
        h.service
            .handle_voice_event(guild(), VoiceEvent::Disconnected)
            .await
    };
    let (joined, handled) = futures_util::future::join(joining, late_disconnect).await;
    joined.unwrap();
    handled.unwrap();

    assert!(h.service.status(guild()).await.is_ok());
    assert_eq!(h.transport.log().destroys, 0);
}

#[tokio::test]
async fn guild_slots_are_released() {
    let h = harness();
    h.join().await;
    assert_eq!(slot_count(&h), 1);
    h.service.leave(guild(), "stop").await.unwrap();
    assert_eq!(slot_count(&h), 0);

    // denied join
    let denied = h
        .service
        .join(
            GuildId::new(2),
            voice(),
            text(),
            owner(),
            SessionOptions {
                session_type: SessionType::Meditation,
                cannabis_content: false,
            },
        )
        .await;
    assert!(matches!(denied, Err(MusicError::AccessDenied(_))));
    assert_eq!(slot_count(&h), 0);

    // failed connect
    h.transport.fail_connect.store(true, Ordering::SeqCst);
    assert!(h
        .service
        .join(guild(), voice(), text(), owner(), SessionOptions::default())
        .await
        .is_err());
    assert_eq!(slot_count(&h), 0);
    h.transport.fail_connect.store(false, Ordering::SeqCst);

    // voice disconnect
    h.join().await;
    h.service
        .handle_voice_event(guild(), VoiceEvent::Disconnected)
        .await
        .unwrap();
    assert_eq!(slot_count(&h), 0);
}

#[tokio::test]
async fn join_waiting_on_a_leave_gets_a_fresh_slot() {
    let h = harness();
    h.join().await;

    let leaving = h.service.leave(guild(), "stop");
    let rejoining = h
        .service
        .join(guild(), voice(), text(), other(), SessionOptions::default());
    let (left, joined) = futures_util::future::join(leaving, rejoining).await;
    assert!(left.unwrap());
    joined.unwrap();

    assert!(h.service.status(guild()).await.is_ok());
    assert_eq!(slot_count(&h), 1);
    assert_eq!(h.transport.log().live_links, 1);
}

#[tokio::test]
async fn only_pending_entries_of_this_session_can_be_played() {
    let h = harness();
    let session = h.join().await;
    let removed = h.service.queue().enqueue(session.id, &track("a", 60)).unwrap();
    let played = h.service.queue().enqueue(session.id, &track("b", 60)).unwrap();
    h.service.queue().remove(session.id, removed.position).unwrap();
    h.service.queue().mark_played(played.id).unwrap();

    let foreign_session = h
        .service
        .join(
            GuildId::new(2),
            voice(),
            text(),
            owner(),
            SessionOptions::default(),
        )
        .await
        .unwrap();
    let foreign = h
        .service
        .queue()
        .enqueue(foreign_session.id, &track("c", 60))
        .unwrap();

    // nothing playing, then something playing
    for _ in 0..2 {
        for entry in [&removed, &played, &foreign] {
            assert!(matches!(
                h.service
                    .play(guild(), TrackRequest::from_entry(entry, owner()))
                    .await,
                Err(MusicError::EntryNotFound(id)) if id == entry.id
            ));
        }
        if h.current_title().await.is_none() {
            h.play("d", owner()).await.unwrap();
        }
    }

    assert!(h.service.queue().get(removed.id).unwrap().unwrap().played_at.is_none());
    assert!(h.service.queue().get(foreign.id).unwrap().unwrap().played_at.is_none());
    assert_eq!(h.current_title().await.as_deref(), Some("d"));
}

#[tokio::test]
async fn failed_advance_still_arms_the_idle_timer() {
    use diesel::connection::SimpleConnection;

    let h = harness_with(MusicConfig {
        idle_disconnect: Some(Duration::from_millis(40)),
        ..MusicConfig::default()
    });
    h.join().await;
    h.play("a", owner()).await.unwrap();
    h.db
        .with_conn(|conn| conn.batch_execute("DROP TABLE music_queue"))
        .unwrap();

    let generation = h.transport.last_generation();
    assert!(h
        .service
        .handle_voice_event(guild(), VoiceEvent::TrackEnded { generation })
        .await
        .is_err());

    eventually("idle disconnect", || h.transport.log().destroys == 1).await;
    assert_eq!(h.last_end_reason().as_deref(), Some(END_IDLE_TIMEOUT));
}
