/// prepayment - restructure the remaining schedule after extra principal
use loan_ledger_rs::{
    CapitalPaymentOutcome, InMemoryStore, Ledger, LedgerStore, LoanTerms, Money, PrepaymentRequest, Rate,
    SafeTimeProvider, TimeSource,
};
use chrono::{Duration, NaiveDate, TimeZone, Utc};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    println!("=== prepayment ===\n");

    let time = SafeTimeProvider::new(TimeSource::Test(
        Utc.with_ymd_and_hms(2024, 1, 10, 9, 0, 0).unwrap()
    ));
    let controller = time.test_control().unwrap();
    let ledger = Ledger::with_defaults(InMemoryStore::new());

    let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
    let shorter = ledger.create_loan(
        &LoanTerms::monthly_simple(Money::from_major(10_000), Rate::from_percentage(2), 10, start),
        &time,
    )?;
    let smaller = ledger.create_loan(
        &LoanTerms::monthly_french(Money::from_major(10_000), Rate::from_percentage(2), 10, start),
        &time,
    )?;

    // hold the installment size: the term shrinks
    let request = PrepaymentRequest::new(Money::from_major(2_500), false);
    let diff = ledger.preview_prepayment(shorter.id, &request, &time)?;
    println!(
        "reduce term: {} -> {} installments, {} rows removed",
        diff.old_count,
        diff.new_count,
        diff.removed.len()
    );
    ledger.apply_prepayment(shorter.id, &request, &time)?;

    // hold the count: every installment shrinks
    let request = PrepaymentRequest::new(Money::from_major(2_500), true);
    let diff = ledger.preview_prepayment(smaller.id, &request, &time)?;
    for change in &diff.changes {
        println!(
            "installment {}: principal {} -> {}, interest {} -> {}",
            change.number, change.old_principal, change.new_principal, change.old_interest, change.new_interest
        );
    }

    // the caller pins the principal it saw, so a retried click is recognised
    let request = request.observed(diff.capital_before);
    ledger.apply_prepayment(smaller.id, &request, &time)?;
    controller.advance(Duration::seconds(30));
    match ledger.apply_prepayment(smaller.id, &request, &time)? {
        CapitalPaymentOutcome::DuplicateSuppressed(existing) => {
            println!("retry suppressed, existing record {}", existing.id)
        }
        CapitalPaymentOutcome::Recorded(_) => println!("unexpected second record"),
    }

    println!(
        "capital payments on record: {}",
        ledger.store().list_capital_payments(smaller.id)?.len()
    );
    println!("pending principal: {}", ledger.balance(smaller.id)?.principal_pending);

    Ok(())
}
